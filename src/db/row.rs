//! Dynamically-typed row values
//!
//! Reconciliation reads whole rows without knowing their Rust shape, so
//! columns are decoded by the storage class SQLite reports for each value.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

/// A single column value, mirroring SQLite storage classes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Column name to value
pub type Row = BTreeMap<String, SqlValue>;

/// Epoch values below this are taken to be seconds rather than milliseconds
const SECONDS_CUTOFF: i64 = 100_000_000_000;

impl SqlValue {
    /// Key form of a row id
    pub fn as_key(&self) -> Option<String> {
        match self {
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
            SqlValue::Text(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    /// Interpret the value as a point in time, in epoch milliseconds
    pub fn as_epoch_millis(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(scale_epoch(*v)),
            SqlValue::Real(v) if v.is_finite() => Some(scale_epoch(*v as i64)),
            SqlValue::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }
}

fn scale_epoch(v: i64) -> i64 {
    if v.unsigned_abs() < SECONDS_CUTOFF.unsigned_abs() {
        v.saturating_mul(1000)
    } else {
        v
    }
}

/// Parse the timestamp layouts rows carry in practice
fn parse_timestamp(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }

    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
    }

    s.parse::<i64>().ok().map(scale_epoch)
}

/// Decode every column of a result row
pub fn decode_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get(idx)?),
                "REAL" => SqlValue::Real(row.try_get(idx)?),
                "BLOB" => SqlValue::Blob(row.try_get(idx)?),
                _ => SqlValue::Text(row.try_get(idx)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }

    Ok(out)
}

/// Bind a dynamically-typed value to a query
pub fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Blob(v) => query.bind(v.clone()),
    }
}
