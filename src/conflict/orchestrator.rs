//! Cleanup passes over conflict copies
//!
//! A pass merges every conflict copy of the live database, newest first,
//! and archives each copy whose outcome is settled:
//! - merged copies become `<name>.merged`
//! - copies with nothing new become `<name>.bak`
//! - failed copies stay where they are for the next pass

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use super::merge::MergeExecutor;
use super::scanner::detect_conflict_copies_of;
use super::types::{
    CleanupReport, ConflictDetail, ConflictFile, ConflictStatus, Disposition, FileOutcome,
    MergeResult,
};
use crate::config::DB_FILE_NAME;
use crate::db::side_file;

const RENAME_ATTEMPTS: u32 = 4;
const RENAME_BACKOFF: Duration = Duration::from_millis(100);

/// Runs cleanup passes for one live database
pub struct ConflictOrchestrator {
    db_path: PathBuf,
    executor: MergeExecutor,
    /// Held for the whole of a pass so two passes never merge the same copy
    pass_lock: Mutex<()>,
}

impl ConflictOrchestrator {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            executor: MergeExecutor::default(),
            pass_lock: Mutex::new(()),
        }
    }

    /// Orchestrator for `<data_dir>/film.db`
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(DB_FILE_NAME))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn data_dir(&self) -> &Path {
        self.db_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn db_file_name(&self) -> String {
        self.db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DB_FILE_NAME.to_string())
    }

    /// Conflict copies of the live database, newest first
    pub fn conflict_copies(&self) -> Vec<ConflictFile> {
        detect_conflict_copies_of(self.data_dir(), &self.db_file_name())
    }

    /// Merge and archive every conflict copy.
    ///
    /// Returns `None` when the live database does not exist yet, since there
    /// is nothing to merge into.
    pub async fn auto_cleanup(&self) -> Option<CleanupReport> {
        let _guard = self.pass_lock.lock().await;

        if !self.db_path.exists() {
            tracing::debug!(
                "No database at {}, skipping conflict cleanup",
                self.db_path.display()
            );
            return None;
        }

        let pass_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("conflict_cleanup", pass_id = %pass_id);

        async move {
            let copies = self.conflict_copies();
            let mut report = CleanupReport {
                pass_id,
                found: copies.len(),
                outcomes: Vec::with_capacity(copies.len()),
            };

            for copy in &copies {
                tracing::info!("Merging conflict copy {}", copy.filename);
                let result = self
                    .executor
                    .merge_conflict(&self.db_path, &copy.path, true)
                    .await;
                report.outcomes.push(settle(copy, result).await);
            }

            if report.found > 0 {
                tracing::info!(
                    "Conflict cleanup finished: {} merged, {} archived, {} left in place",
                    report.count(Disposition::Merged),
                    report.count(Disposition::Archived),
                    report.count(Disposition::Failed)
                        + report.count(Disposition::ManualReview)
                        + report.count(Disposition::ArchiveFailed)
                );
            }

            Some(report)
        }
        .instrument(span)
        .await
    }

    /// Analyse every conflict copy without changing anything on disk
    pub async fn conflict_status(&self) -> ConflictStatus {
        let mut conflicts = Vec::new();

        for copy in self.conflict_copies() {
            let preview = self
                .executor
                .merge_conflict(&self.db_path, &copy.path, false)
                .await;
            if let Some(e) = &preview.error {
                tracing::warn!("Cannot analyse {}: {}", copy.filename, e);
            }

            conflicts.push(ConflictDetail {
                filename: copy.filename,
                origin_hostname: copy.origin_hostname,
                modified_time: copy.modified_time,
                size_bytes: copy.size_bytes,
                needs_merge: preview.needs_manual_review(),
                analysis: preview.conflicts.unwrap_or_default(),
                error: preview.error,
            });
        }

        ConflictStatus {
            has_conflicts: !conflicts.is_empty(),
            conflicts,
        }
    }
}

/// Decide what happens to a copy after its merge attempt
async fn settle(copy: &ConflictFile, result: MergeResult) -> FileOutcome {
    let (disposition, suffix) = if result.merged && result.safe {
        (Disposition::Merged, Some("merged"))
    } else if result.safe {
        (Disposition::Archived, Some("bak"))
    } else if result.needs_manual_review() {
        (Disposition::ManualReview, None)
    } else {
        (Disposition::Failed, None)
    };

    let Some(suffix) = suffix else {
        match &result.error {
            Some(e) => tracing::warn!("Leaving {} in place: {}", copy.filename, e),
            None => tracing::warn!("Leaving {} in place for manual review", copy.filename),
        }
        return FileOutcome {
            filename: copy.filename.clone(),
            disposition,
            archived_as: None,
            result,
        };
    };

    let target = archive_path(&copy.path, suffix);
    match rename_with_retry(&copy.path, &target).await {
        Ok(()) => {
            archive_side_files(&copy.path, &target).await;
            tracing::info!("Archived {} as {}", copy.filename, target.display());
            FileOutcome {
                filename: copy.filename.clone(),
                disposition,
                archived_as: Some(target),
                result,
            }
        }
        Err(e) => {
            // A merged copy left in place is merged again next pass
            tracing::error!(
                "Failed to archive {} after {} attempts: {}",
                copy.filename,
                RENAME_ATTEMPTS,
                e
            );
            FileOutcome {
                filename: copy.filename.clone(),
                disposition: Disposition::ArchiveFailed,
                archived_as: None,
                result,
            }
        }
    }
}

/// `<path>.<suffix>`, keeping the original extension
pub fn archive_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Move a copy's own `-wal`/`-shm` files so they keep pairing with the archive
async fn archive_side_files(from: &Path, to: &Path) {
    for suffix in ["-wal", "-shm"] {
        let side = side_file(from, suffix);
        if !side.exists() {
            continue;
        }
        if let Err(e) = rename_with_retry(&side, &side_file(to, suffix)).await {
            tracing::warn!("Failed to archive {}: {}", side.display(), e);
        }
    }
}

async fn rename_with_retry(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut delay = RENAME_BACKOFF;
    let mut attempt = 1;

    loop {
        match tokio::fs::rename(from, to).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < RENAME_ATTEMPTS => {
                tracing::debug!(
                    "Rename of {} failed (attempt {}): {}",
                    from.display(),
                    attempt,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::initialize_schema;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
    use sqlx::SqlitePool;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn seeded(path: &Path, rolls: &[(i64, &str, &str)]) {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
        )
        .await
        .unwrap();
        initialize_schema(&pool).await.unwrap();
        for (id, title, updated_at) in rolls {
            sqlx::query(
                "INSERT INTO rolls (id, title, created_at, updated_at) VALUES (?, ?, '2024-01-01 00:00:00', ?)",
            )
            .bind(id)
            .bind(title)
            .bind(updated_at)
            .execute(&pool)
            .await
            .unwrap();
        }
        pool.close().await;
    }

    #[test]
    fn test_archive_path_keeps_name() {
        assert_eq!(
            archive_path(Path::new("/data/film-LAPTOP.db"), "merged"),
            PathBuf::from("/data/film-LAPTOP.db.merged")
        );
    }

    #[tokio::test]
    async fn test_no_main_database_skips_pass() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("film-LAPTOP.db"), b"").unwrap();

        let orchestrator = ConflictOrchestrator::for_data_dir(dir.path());
        assert!(orchestrator.auto_cleanup().await.is_none());
        assert!(dir.path().join("film-LAPTOP.db").exists());
    }

    #[tokio::test]
    async fn test_identical_copy_is_archived_as_bak() {
        let dir = TempDir::new().unwrap();
        let rolls = [(1, "Portra", "2024-02-01 00:00:00")];
        seeded(&dir.path().join("film.db"), &rolls).await;
        seeded(&dir.path().join("film-LAPTOP.db"), &rolls).await;

        let report = ConflictOrchestrator::for_data_dir(dir.path())
            .auto_cleanup()
            .await
            .unwrap();

        assert_eq!(report.found, 1);
        assert_eq!(report.count(Disposition::Archived), 1);
        assert!(!dir.path().join("film-LAPTOP.db").exists());
        assert!(dir.path().join("film-LAPTOP.db.bak").exists());
    }

    #[tokio::test]
    async fn test_newer_copy_is_merged_and_renamed() {
        let dir = TempDir::new().unwrap();
        seeded(&dir.path().join("film.db"), &[(1, "Portra", "2024-02-01 00:00:00")]).await;
        seeded(
            &dir.path().join("film-LAPTOP.db"),
            &[(1, "Portra 800", "2024-02-05 00:00:00")],
        )
        .await;

        let report = ConflictOrchestrator::for_data_dir(dir.path())
            .auto_cleanup()
            .await
            .unwrap();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.disposition, Disposition::Merged);
        assert_eq!(outcome.result.records_merged, Some(1));
        assert_eq!(
            outcome.archived_as.as_deref(),
            Some(dir.path().join("film-LAPTOP.db.merged").as_path())
        );
        assert!(!dir.path().join("film-LAPTOP.db").exists());

        // Archived copies are not picked up again
        let second = ConflictOrchestrator::for_data_dir(dir.path())
            .auto_cleanup()
            .await
            .unwrap();
        assert_eq!(second.found, 0);
    }

    #[tokio::test]
    async fn test_unreadable_copy_stays_in_place() {
        let dir = TempDir::new().unwrap();
        seeded(&dir.path().join("film.db"), &[]).await;
        std::fs::write(dir.path().join("film-BROKEN.db"), vec![b'x'; 8192]).unwrap();

        let orchestrator = ConflictOrchestrator::for_data_dir(dir.path());
        let report = orchestrator.auto_cleanup().await.unwrap();

        assert_eq!(report.count(Disposition::Failed), 1);
        assert!(report.outcomes[0].result.error.is_some());
        assert!(dir.path().join("film-BROKEN.db").exists());
        assert!(!dir.path().join("film-BROKEN.db.bak").exists());

        let status = orchestrator.conflict_status().await;
        assert!(status.has_conflicts);
        assert!(status.conflicts[0].error.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_passes_merge_each_copy_once() {
        let dir = TempDir::new().unwrap();
        seeded(&dir.path().join("film.db"), &[]).await;
        seeded(
            &dir.path().join("film-LAPTOP.db"),
            &[(1, "Delta 3200", "2024-02-05 00:00:00")],
        )
        .await;

        let orchestrator = Arc::new(ConflictOrchestrator::for_data_dir(dir.path()));
        let (a, b) = tokio::join!(orchestrator.auto_cleanup(), orchestrator.auto_cleanup());
        let merged = [a.unwrap(), b.unwrap()]
            .iter()
            .map(|r| r.count(Disposition::Merged))
            .sum::<usize>();
        assert_eq!(merged, 1);

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new().filename(dir.path().join("film.db")),
        )
        .await
        .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rolls")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_status_reports_without_touching_files() {
        let dir = TempDir::new().unwrap();
        seeded(&dir.path().join("film.db"), &[]).await;
        seeded(
            &dir.path().join("film-LAPTOP.db"),
            &[(1, "Ektar", "2024-02-05 00:00:00")],
        )
        .await;

        let status = ConflictOrchestrator::for_data_dir(dir.path())
            .conflict_status()
            .await;

        assert!(status.has_conflicts);
        let detail = &status.conflicts[0];
        assert_eq!(detail.origin_hostname, "LAPTOP");
        assert!(detail.needs_merge);
        assert!(detail.error.is_none());
        let rolls = detail
            .analysis
            .iter()
            .find(|info| info.table == crate::db::ReconciledTable::Rolls)
            .unwrap();
        assert_eq!(rolls.to_import_count, 1);
        assert!(dir.path().join("film-LAPTOP.db").exists());
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn open_wal(path: &Path) -> SqlitePool {
        SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_wal_mode_copy_leaves_no_side_files() {
        let dir = TempDir::new().unwrap();
        seeded(&dir.path().join("film.db"), &[]).await;

        let copy = dir.path().join("film-LAPTOP.db");
        let pool = open_wal(&copy).await;
        initialize_schema(&pool).await.unwrap();
        sqlx::query("INSERT INTO rolls (id, title, updated_at) VALUES (1, 'Gold 200', '2024-02-05 00:00:00')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
        assert!(!side_file(&copy, "-wal").exists());

        let report = ConflictOrchestrator::for_data_dir(dir.path())
            .auto_cleanup()
            .await
            .unwrap();

        assert_eq!(report.count(Disposition::Merged), 1);
        assert_eq!(
            file_names(dir.path()),
            vec!["film-LAPTOP.db.merged".to_string(), "film.db".to_string()]
        );
    }

    #[tokio::test]
    async fn test_copy_side_files_move_with_archive() {
        let dir = TempDir::new().unwrap();
        seeded(&dir.path().join("film.db"), &[]).await;

        // Held open so the copy keeps its own write-ahead log
        let copy = dir.path().join("film-LAPTOP.db");
        let pool = open_wal(&copy).await;
        initialize_schema(&pool).await.unwrap();
        sqlx::query("INSERT INTO rolls (id, title, updated_at) VALUES (1, 'Velvia 50', '2024-02-05 00:00:00')")
            .execute(&pool)
            .await
            .unwrap();
        assert!(side_file(&copy, "-wal").exists());

        let report = ConflictOrchestrator::for_data_dir(dir.path())
            .auto_cleanup()
            .await
            .unwrap();

        assert_eq!(report.count(Disposition::Merged), 1);
        let archived = dir.path().join("film-LAPTOP.db.merged");
        assert!(archived.exists());
        assert!(side_file(&archived, "-wal").exists());
        assert!(!copy.exists());
        assert!(!side_file(&copy, "-wal").exists());
        assert!(!side_file(&copy, "-shm").exists());

        pool.close().await;
    }

    #[tokio::test]
    async fn test_blocked_rename_is_reported_and_copy_kept() {
        let dir = TempDir::new().unwrap();
        let rolls = [(1, "Portra", "2024-02-01 00:00:00")];
        seeded(&dir.path().join("film.db"), &rolls).await;
        seeded(&dir.path().join("film-LAPTOP.db"), &rolls).await;

        // A non-empty directory where the archive should go
        let blocker = dir.path().join("film-LAPTOP.db.bak");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let started = std::time::Instant::now();
        let report = ConflictOrchestrator::for_data_dir(dir.path())
            .auto_cleanup()
            .await
            .unwrap();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.disposition, Disposition::ArchiveFailed);
        assert!(outcome.archived_as.is_none());
        assert!(outcome.result.safe);
        assert!(dir.path().join("film-LAPTOP.db").exists());
        assert!(blocker.join("keep").exists());

        // Three backoff sleeps between four attempts: 100 + 200 + 400 ms
        assert!(started.elapsed() >= Duration::from_millis(700));
    }
}
