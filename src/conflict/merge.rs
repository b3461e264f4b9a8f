//! Merge execution
//!
//! Applies a comparison's merge plan to the live database in one
//! transaction. Individual rows may fail without aborting the transaction;
//! only a failed COMMIT rolls everything back.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use thiserror::Error;

use super::comparator::compare_dbs;
use super::patch::{id_value, PatchError, RowPatch};
use super::types::{MergeResult, MergeTally, RecordToMerge};
use crate::db::bind_value;

/// Why a single record could not be merged
#[derive(Debug, Error)]
enum RowError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("row {0} no longer exists")]
    Missing(String),
}

/// Applies conflict copies to the live database
#[derive(Debug, Clone)]
pub struct MergeExecutor {
    /// How long the writer waits on locks held by the sync client or the app
    busy_timeout: Duration,
}

impl MergeExecutor {
    pub fn new(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }

    /// Compare `conflict_path` with `main_path` and, when `auto_merge` is set,
    /// apply the plan.
    ///
    /// Never returns an error: failures are reported in the result so the
    /// caller can leave the conflict copy in place.
    pub async fn merge_conflict(
        &self,
        main_path: &Path,
        conflict_path: &Path,
        auto_merge: bool,
    ) -> MergeResult {
        let comparison = match compare_dbs(main_path, conflict_path).await {
            Ok(comparison) => comparison,
            Err(e) => {
                tracing::warn!("Comparison with {} failed: {}", conflict_path.display(), e);
                return MergeResult::failed(e.to_string());
            }
        };

        if !comparison.needs_merge() {
            return MergeResult::nothing_to_merge(comparison.conflicts);
        }

        if !auto_merge {
            return MergeResult::preview(comparison.conflicts, comparison.records_to_merge);
        }

        let mut conn = match self.open_writer(main_path).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Cannot open {} for merge: {}", main_path.display(), e);
                return MergeResult::failed(e.to_string());
            }
        };

        if let Err(e) = sqlx::query("BEGIN IMMEDIATE").execute(&mut conn).await {
            tracing::warn!("Cannot start merge transaction: {}", e);
            close_quietly(conn).await;
            return MergeResult::failed(e.to_string());
        }

        let mut tally = MergeTally::default();
        for record in &comparison.records_to_merge {
            match apply_record(&mut conn, record).await {
                Ok(()) => tally.record(true),
                Err(e) => {
                    tracing::warn!(
                        "Skipping {} record {}: {}",
                        record.table,
                        record.id.as_deref().unwrap_or("(new)"),
                        e
                    );
                    tally.record(false);
                }
            }
        }

        match sqlx::query("COMMIT").execute(&mut conn).await {
            Ok(_) => {
                close_quietly(conn).await;
                tracing::info!(
                    "Merged {} records from {} ({} failed)",
                    tally.succeeded,
                    conflict_path.display(),
                    tally.failed
                );
                MergeResult::committed(tally, comparison.conflicts)
            }
            Err(e) => {
                tracing::error!("Merge commit failed, rolling back: {}", e);
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut conn).await {
                    tracing::error!("Rollback failed: {}", rollback);
                }
                close_quietly(conn).await;
                MergeResult::failed(e.to_string())
            }
        }
    }

    async fn open_writer(&self, path: &Path) -> Result<SqliteConnection, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .busy_timeout(self.busy_timeout);

        SqliteConnection::connect_with(&options).await
    }
}

impl Default for MergeExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

async fn apply_record(conn: &mut SqliteConnection, record: &RecordToMerge) -> Result<(), RowError> {
    let patch = RowPatch::from_record(record.table, &record.record)?;

    match &record.id {
        Some(id) => {
            let sql = patch.update_sql();
            let query = bind_value(patch.bind_values(sqlx::query(&sql)), &id_value(id));
            let done = query.execute(&mut *conn).await?;
            if done.rows_affected() == 0 {
                return Err(RowError::Missing(id.clone()));
            }
        }
        None => {
            let sql = patch.insert_sql();
            patch.bind_values(sqlx::query(&sql)).execute(&mut *conn).await?;
        }
    }

    Ok(())
}

async fn close_quietly(conn: SqliteConnection) {
    if let Err(e) = conn.close().await {
        tracing::debug!("Error closing merge connection: {}", e);
    }
}
