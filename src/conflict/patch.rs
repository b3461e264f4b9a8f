//! Whitelisted row patches
//!
//! A patch holds the writable columns of one record in a fixed order. SQL
//! text is built only from the table's static column whitelist, never from
//! keys found in a conflict copy.

use thiserror::Error;

use crate::db::{bind_value, ReconciledTable, Row, SqlValue};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("Column '{column}' is not writable on {table}")]
    UnknownColumn {
        table: ReconciledTable,
        column: String,
    },

    #[error("Record for {0} has no writable columns")]
    Empty(ReconciledTable),
}

/// Writable columns of one record, validated against the table whitelist
#[derive(Debug, Clone, PartialEq)]
pub struct RowPatch {
    table: ReconciledTable,
    columns: Vec<&'static str>,
    values: Vec<SqlValue>,
}

impl RowPatch {
    /// Build a patch from a record. `id` is dropped; any other column the
    /// table does not whitelist rejects the whole record.
    pub fn from_record(table: ReconciledTable, record: &Row) -> Result<Self, PatchError> {
        let mut columns = Vec::with_capacity(record.len());
        let mut values = Vec::with_capacity(record.len());

        for (key, value) in record {
            if key == "id" {
                continue;
            }
            let column = table.column(key).ok_or_else(|| PatchError::UnknownColumn {
                table,
                column: key.clone(),
            })?;
            columns.push(column);
            values.push(value.clone());
        }

        if columns.is_empty() {
            return Err(PatchError::Empty(table));
        }

        Ok(Self {
            table,
            columns,
            values,
        })
    }

    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    /// `UPDATE <table> SET <col> = ?, ... WHERE id = ?`
    pub fn update_sql(&self) -> String {
        let assignments: Vec<String> = self.columns.iter().map(|c| format!("{} = ?", c)).collect();
        format!(
            "UPDATE {} SET {} WHERE id = ?",
            self.table.name(),
            assignments.join(", ")
        )
    }

    /// `INSERT INTO <table> (<cols>) VALUES (?, ...)`, id left to autoincrement
    pub fn insert_sql(&self) -> String {
        let placeholders: Vec<&str> = self.columns.iter().map(|_| "?").collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table.name(),
            self.columns.join(", "),
            placeholders.join(", ")
        )
    }

    /// Bind the column values in statement order
    pub fn bind_values<'q>(
        &self,
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        for value in &self.values {
            query = bind_value(query, value);
        }
        query
    }
}

/// Typed form of a row id for binding
pub fn id_value(id: &str) -> SqlValue {
    id.parse::<i64>()
        .map(SqlValue::Integer)
        .unwrap_or_else(|_| SqlValue::Text(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roll_record() -> Row {
        let mut row = Row::new();
        row.insert("id".into(), SqlValue::Integer(4));
        row.insert("title".into(), SqlValue::Text("Ektar".into()));
        row.insert("updated_at".into(), SqlValue::Text("2024-05-01 00:00:00".into()));
        row
    }

    #[test]
    fn test_statements_use_whitelisted_columns() {
        let patch = RowPatch::from_record(ReconciledTable::Rolls, &roll_record()).unwrap();
        assert_eq!(patch.columns(), &["title", "updated_at"]);
        assert_eq!(
            patch.update_sql(),
            "UPDATE rolls SET title = ?, updated_at = ? WHERE id = ?"
        );
        assert_eq!(
            patch.insert_sql(),
            "INSERT INTO rolls (title, updated_at) VALUES (?, ?)"
        );
    }

    #[test]
    fn test_unknown_column_rejected() {
        let mut record = roll_record();
        record.insert("title = 'x'; --".into(), SqlValue::Null);

        let err = RowPatch::from_record(ReconciledTable::Rolls, &record).unwrap_err();
        assert!(matches!(err, PatchError::UnknownColumn { .. }));
    }

    #[test]
    fn test_column_from_another_table_rejected() {
        let mut record = roll_record();
        record.insert("roll_id".into(), SqlValue::Integer(1));

        let err = RowPatch::from_record(ReconciledTable::Rolls, &record).unwrap_err();
        assert_eq!(
            err,
            PatchError::UnknownColumn {
                table: ReconciledTable::Rolls,
                column: "roll_id".to_string()
            }
        );
    }

    #[test]
    fn test_id_only_record_is_empty() {
        let mut record = Row::new();
        record.insert("id".into(), SqlValue::Integer(1));
        assert_eq!(
            RowPatch::from_record(ReconciledTable::Films, &record),
            Err(PatchError::Empty(ReconciledTable::Films))
        );
    }

    #[test]
    fn test_id_value() {
        assert_eq!(id_value("12"), SqlValue::Integer(12));
        assert_eq!(id_value("abc"), SqlValue::Text("abc".into()));
    }
}
