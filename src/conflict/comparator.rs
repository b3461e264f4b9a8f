//! Table-by-table comparison of the live database and a conflict copy
//!
//! Resolution is last-writer-wins per row on `max(updated_at, created_at)`.
//! The live database wins ties, and rows only the live database has are
//! never touched: a conflict copy cannot delete.

use std::path::Path;

use futures::future::join_all;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::types::{ComparisonResult, ConflictInfo, RecordToMerge, TableSnapshot};
use super::ConflictError;
use crate::db::{decode_row, side_file, ReconciledTable, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Main,
    Conflict,
}

/// Compare every reconciled table of `main_path` against `conflict_path`.
///
/// Both files are opened read-only. A conflict copy without a `-wal` file is
/// opened immutable so SQLite leaves no side files next to it. All table
/// reads run concurrently and are joined before either handle is closed. A
/// table that cannot be read is treated as empty on that side.
pub async fn compare_dbs(
    main_path: &Path,
    conflict_path: &Path,
) -> Result<ComparisonResult, ConflictError> {
    let main_pool = open_read_only(main_path, false).await?;
    let immutable = !side_file(conflict_path, "-wal").exists();
    let conflict_pool = match open_read_only(conflict_path, immutable).await {
        Ok(pool) => pool,
        Err(e) => {
            main_pool.close().await;
            return Err(e);
        }
    };

    let reads = ReconciledTable::ALL
        .into_iter()
        .flat_map(|table| {
            [
                (Side::Main, table, &main_pool),
                (Side::Conflict, table, &conflict_pool),
            ]
        })
        .map(|(side, table, pool)| async move { (side, table, load_table(pool, table).await) });

    let loaded = join_all(reads).await;

    main_pool.close().await;
    conflict_pool.close().await;
    if immutable {
        remove_stray_side_files(conflict_path);
    }

    let mut result = ComparisonResult::default();
    for (side, table, snapshot) in loaded {
        let snapshot = snapshot.unwrap_or_else(|e| {
            tracing::warn!(
                "Failed to read {} from {:?} database, treating as empty: {}",
                table,
                side,
                e
            );
            TableSnapshot::new()
        });

        match side {
            Side::Main => result.main.insert(table, snapshot),
            Side::Conflict => result.conflict.insert(table, snapshot),
        };
    }

    let empty = TableSnapshot::new();
    for table in ReconciledTable::ALL {
        let main = result.main.get(&table).unwrap_or(&empty);
        let conflict = result.conflict.get(&table).unwrap_or(&empty);

        let (info, mut records) = diff_table(table, main, conflict);
        tracing::debug!(
            "{}: {} only in main, {} only in conflict, {} in both, {} to import, {} to update",
            table,
            info.only_in_main_count,
            info.only_in_conflict_count,
            info.in_both_count,
            info.to_import_count,
            info.to_update_count
        );

        result.conflicts.push(info);
        result.records_to_merge.append(&mut records);
    }

    Ok(result)
}

async fn open_read_only(path: &Path, immutable: bool) -> Result<SqlitePool, ConflictError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .immutable(immutable)
        .create_if_missing(false);

    let open_error = |source| ConflictError::Open {
        path: path.to_path_buf(),
        source,
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(ReconciledTable::ALL.len() as u32)
        .connect_with(options)
        .await
        .map_err(open_error)?;

    // SQLite opens lazily; reading the schema catches files that are not databases
    if let Err(e) = sqlx::query("SELECT count(*) FROM sqlite_master")
        .fetch_one(&pool)
        .await
    {
        pool.close().await;
        return Err(open_error(e));
    }

    Ok(pool)
}

/// Drop empty `-wal`/`-shm` files a read of a copy that had none may leave behind
fn remove_stray_side_files(path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let side = side_file(path, suffix);
        if side.exists() {
            match std::fs::remove_file(&side) {
                Ok(()) => tracing::debug!("Removed {}", side.display()),
                Err(e) => tracing::warn!("Cannot remove {}: {}", side.display(), e),
            }
        }
    }
}

async fn load_table(pool: &SqlitePool, table: ReconciledTable) -> Result<TableSnapshot, sqlx::Error> {
    let rows = sqlx::query(&table.select_all_sql()).fetch_all(pool).await?;

    let mut snapshot = TableSnapshot::new();
    for row in &rows {
        let row = decode_row(row)?;
        match row.get("id").and_then(|id| id.as_key()) {
            Some(id) => {
                snapshot.insert(id, row);
            }
            None => tracing::debug!("Skipping {} row without an id", table),
        }
    }

    Ok(snapshot)
}

/// Diff one table. Each conflict row yields at most one merge entry.
pub fn diff_table(
    table: ReconciledTable,
    main: &TableSnapshot,
    conflict: &TableSnapshot,
) -> (ConflictInfo, Vec<RecordToMerge>) {
    let mut to_import = Vec::new();
    let mut to_update = Vec::new();
    let mut in_both = 0;

    for (id, conflict_row) in conflict {
        match main.get(id) {
            None => to_import.push(RecordToMerge {
                table,
                id: None,
                record: conflict_row.clone(),
            }),
            Some(main_row) => {
                in_both += 1;
                if record_timestamp(conflict_row) > record_timestamp(main_row) {
                    to_update.push(RecordToMerge {
                        table,
                        id: Some(id.clone()),
                        record: conflict_row.clone(),
                    });
                }
            }
        }
    }

    let only_in_main = main.keys().filter(|id| !conflict.contains_key(*id)).count();

    let info = ConflictInfo {
        table,
        only_in_main_count: only_in_main,
        only_in_conflict_count: to_import.len(),
        in_both_count: in_both,
        to_import_count: to_import.len(),
        to_update_count: to_update.len(),
        needs_merge: !to_import.is_empty() || !to_update.is_empty(),
    };

    to_import.append(&mut to_update);
    (info, to_import)
}

/// `max(updated_at, created_at)` in epoch milliseconds, 0 when neither parses
pub fn record_timestamp(row: &Row) -> i64 {
    ["updated_at", "created_at"]
        .into_iter()
        .filter_map(|column| row.get(column).and_then(|v| v.as_epoch_millis()))
        .max()
        .unwrap_or(0)
}
