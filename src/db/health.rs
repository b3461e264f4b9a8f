//! Database health reporting
//!
//! Looks at the live file and its side files on disk, asks the engine for
//! its effective settings, and derives warnings an operator should act on.

use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use super::side_file;

/// WAL files above this size are reported as oversized
pub const WAL_SIZE_WARNING_BYTES: u64 = 64 * 1024 * 1024;

/// On-disk facts about one file
#[derive(Debug, Clone, Serialize)]
pub struct FileStatus {
    pub exists: bool,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    #[serde(rename = "modifiedTime", skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<DateTime<Utc>>,
    /// Seconds since last modification
    #[serde(rename = "ageSeconds", skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<u64>,
}

impl FileStatus {
    pub fn stat(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let modified = meta.modified().ok();
                FileStatus {
                    exists: true,
                    size_bytes: meta.len(),
                    modified_time: modified.map(DateTime::<Utc>::from),
                    age_seconds: modified
                        .and_then(|m| SystemTime::now().duration_since(m).ok())
                        .map(|d| d.as_secs()),
                }
            }
            Err(_) => FileStatus {
                exists: false,
                size_bytes: 0,
                modified_time: None,
                age_seconds: None,
            },
        }
    }
}

/// Settings the engine reports for the live connection
#[derive(Debug, Clone, Serialize)]
pub struct EngineSettings {
    #[serde(rename = "journalMode")]
    pub journal_mode: String,
    pub synchronous: String,
}

/// Health of the live database
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub database: FileStatus,
    pub wal: FileStatus,
    #[serde(rename = "legacyJournal")]
    pub legacy_journal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSettings>,
    pub warnings: Vec<String>,
}

impl DatabaseHealth {
    /// Collect a report. `pool` is absent when the live connection is not serving.
    ///
    /// A WAL file is stale once it outlives two checkpoint intervals.
    pub async fn collect(
        db_path: &Path,
        pool: Option<&SqlitePool>,
        checkpoint_interval: Duration,
    ) -> Result<Self, sqlx::Error> {
        let database = FileStatus::stat(db_path);
        let wal = FileStatus::stat(&side_file(db_path, "-wal"));
        let legacy_journal = side_file(db_path, "-journal").exists();

        let engine = match pool {
            Some(pool) => Some(engine_settings(pool).await?),
            None => None,
        };

        let warnings = derive_warnings(
            &database,
            &wal,
            legacy_journal,
            engine.as_ref(),
            checkpoint_interval * 2,
        );

        Ok(DatabaseHealth {
            database,
            wal,
            legacy_journal,
            engine,
            warnings,
        })
    }
}

async fn engine_settings(pool: &SqlitePool) -> Result<EngineSettings, sqlx::Error> {
    let (journal_mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(pool)
        .await?;
    let (synchronous,): (i64,) = sqlx::query_as("PRAGMA synchronous")
        .fetch_one(pool)
        .await?;

    Ok(EngineSettings {
        journal_mode: journal_mode.to_lowercase(),
        synchronous: synchronous_name(synchronous).to_string(),
    })
}

fn synchronous_name(level: i64) -> &'static str {
    match level {
        0 => "off",
        1 => "normal",
        2 => "full",
        3 => "extra",
        _ => "unknown",
    }
}

fn derive_warnings(
    database: &FileStatus,
    wal: &FileStatus,
    legacy_journal: bool,
    engine: Option<&EngineSettings>,
    stale_after: Duration,
) -> Vec<String> {
    let mut warnings = Vec::new();

    if !database.exists {
        warnings.push("Database file does not exist".to_string());
    }

    if wal.exists && wal.size_bytes > 0 {
        if let Some(age) = wal.age_seconds {
            if age > stale_after.as_secs() {
                warnings.push(format!(
                    "WAL file has not been checkpointed for {}s",
                    age
                ));
            }
        }
    }

    if wal.size_bytes > WAL_SIZE_WARNING_BYTES {
        warnings.push(format!(
            "WAL file is {} MiB, checkpoints may be failing",
            wal.size_bytes / (1024 * 1024)
        ));
    }

    let in_wal_mode = engine.map(|e| e.journal_mode == "wal").unwrap_or(false);
    if legacy_journal && in_wal_mode {
        warnings.push("Legacy rollback journal present while in WAL mode".to_string());
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(exists: bool, size_bytes: u64, age_seconds: Option<u64>) -> FileStatus {
        FileStatus {
            exists,
            size_bytes,
            modified_time: None,
            age_seconds,
        }
    }

    fn wal_engine() -> EngineSettings {
        EngineSettings {
            journal_mode: "wal".to_string(),
            synchronous: "normal".to_string(),
        }
    }

    #[test]
    fn test_healthy_database_has_no_warnings() {
        let warnings = derive_warnings(
            &status(true, 4096, Some(1)),
            &status(true, 8192, Some(5)),
            false,
            Some(&wal_engine()),
            Duration::from_secs(600),
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_stale_and_oversized_wal() {
        let warnings = derive_warnings(
            &status(true, 4096, Some(1)),
            &status(true, WAL_SIZE_WARNING_BYTES + 1, Some(3600)),
            false,
            Some(&wal_engine()),
            Duration::from_secs(600),
        );
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_legacy_journal_only_flagged_in_wal_mode() {
        let truncate = EngineSettings {
            journal_mode: "truncate".to_string(),
            synchronous: "full".to_string(),
        };
        let db = status(true, 4096, Some(1));
        let wal = status(false, 0, None);

        assert!(derive_warnings(&db, &wal, true, Some(&truncate), Duration::from_secs(600))
            .is_empty());
        assert_eq!(
            derive_warnings(&db, &wal, true, Some(&wal_engine()), Duration::from_secs(600)).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_collect_without_live_connection() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("film.db");

        let report = DatabaseHealth::collect(&path, None, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(!report.database.exists);
        assert!(!report.wal.exists);
        assert!(report.engine.is_none());
        assert_eq!(report.warnings, vec!["Database file does not exist".to_string()]);
    }
}
