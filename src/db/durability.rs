//! Durability and lifecycle management for the live database
//!
//! The [`DurabilityManager`] owns the single read-write connection to the
//! live database. It chooses between write-ahead logging and single-file
//! truncate journaling, applies the matching tuning pragmas, runs the
//! periodic passive checkpoint, and tears everything down in a fixed order
//! so the sync client never observes a half-checkpointed file.
//!
//! Lifecycle:
//!
//! ```text
//! Uninitialized -> Opening -> Tuning -> SchemaReady -> Serving
//!                                      -> Draining -> Checkpointing -> Closed
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::Connection;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::health::DatabaseHealth;
use super::schema::initialize_schema;
use super::side_file;
use crate::config::DatabaseConfig;

/// Delay before checking that side files were removed after close
const SIDE_FILE_GRACE: Duration = Duration::from_millis(500);

/// Journal mode of the live database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-ahead log with periodic checkpoints
    Wal,
    /// Single-file journaling, every commit lands in the main file
    Truncate,
}

impl JournalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalMode::Wal => "wal",
            JournalMode::Truncate => "truncate",
        }
    }
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wal" => Ok(JournalMode::Wal),
            "truncate" => Ok(JournalMode::Truncate),
            other => Err(format!("unsupported journal mode: {}", other)),
        }
    }
}

/// Lifecycle phase of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Uninitialized,
    Opening,
    Tuning,
    SchemaReady,
    Serving,
    Draining,
    Checkpointing,
    Closed,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Uninitialized => "uninitialized",
            LifecyclePhase::Opening => "opening",
            LifecyclePhase::Tuning => "tuning",
            LifecyclePhase::SchemaReady => "schema_ready",
            LifecyclePhase::Serving => "serving",
            LifecyclePhase::Draining => "draining",
            LifecyclePhase::Checkpointing => "checkpointing",
            LifecyclePhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Durability errors
#[derive(Debug, Error)]
pub enum DurabilityError {
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database is not serving (phase: {0})")]
    NotServing(LifecyclePhase),

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection tuning for one journal mode
#[derive(Debug, Clone)]
pub struct DurabilityProfile {
    pub journal_mode: JournalMode,
    pub synchronous: SqliteSynchronous,
    pub busy_timeout: Duration,
    /// Page cache budget in KiB
    pub cache_kib: i64,
    pub journal_size_limit: i64,
    pub mmap_size: i64,
    pub wal_autocheckpoint: Option<u32>,
}

impl DurabilityProfile {
    pub fn for_mode(mode: JournalMode) -> Self {
        match mode {
            JournalMode::Truncate => DurabilityProfile {
                journal_mode: mode,
                synchronous: SqliteSynchronous::Full,
                busy_timeout: Duration::from_secs(10),
                cache_kib: 8 * 1024,
                journal_size_limit: 16 * 1024 * 1024,
                mmap_size: 64 * 1024 * 1024,
                wal_autocheckpoint: None,
            },
            JournalMode::Wal => DurabilityProfile {
                journal_mode: mode,
                synchronous: SqliteSynchronous::Normal,
                busy_timeout: Duration::from_secs(5),
                cache_kib: 32 * 1024,
                journal_size_limit: 64 * 1024 * 1024,
                mmap_size: 256 * 1024 * 1024,
                wal_autocheckpoint: Some(1000),
            },
        }
    }

    /// Connect options applying every directive of the profile.
    ///
    /// Locking stays NORMAL in both modes: exclusive locking would shut the
    /// sync client out of the file.
    pub fn connect_options(&self, path: &Path) -> SqliteConnectOptions {
        let journal_mode = match self.journal_mode {
            JournalMode::Wal => SqliteJournalMode::Wal,
            JournalMode::Truncate => SqliteJournalMode::Truncate,
        };

        let mut options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .synchronous(self.synchronous)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(self.busy_timeout)
            .pragma("cache_size", format!("-{}", self.cache_kib))
            .pragma("journal_size_limit", self.journal_size_limit.to_string())
            .pragma("mmap_size", self.mmap_size.to_string());

        if let Some(pages) = self.wal_autocheckpoint {
            options = options.pragma("wal_autocheckpoint", pages.to_string());
        }

        options
    }
}

/// Pick the journal mode: explicit override, then the write-through flag, then WAL
pub fn select_journal_mode(explicit: Option<JournalMode>, write_through: bool) -> JournalMode {
    match explicit {
        Some(mode) => mode,
        None if write_through => JournalMode::Truncate,
        None => JournalMode::Wal,
    }
}

/// Checkpoint strength
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Copy what it can without blocking readers or writers
    Passive,
    /// Copy everything, then truncate the WAL to zero bytes
    Truncate,
}

impl CheckpointKind {
    fn pragma(self) -> &'static str {
        match self {
            CheckpointKind::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            CheckpointKind::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

/// Outcome of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointReport {
    /// Frames copied from the WAL into the main file
    #[serde(rename = "changesMerged")]
    pub changes_merged: i64,
    /// Frames in the WAL when the checkpoint ran
    #[serde(rename = "walFrames")]
    pub wal_frames: i64,
    /// Whether the checkpoint was blocked from completing
    pub busy: bool,
    pub mode: JournalMode,
}

impl CheckpointReport {
    fn skipped(mode: JournalMode) -> Self {
        Self {
            changes_merged: 0,
            wal_frames: 0,
            busy: false,
            mode,
        }
    }
}

/// Run a checkpoint against the live pool. A no-op outside WAL mode.
pub async fn run_checkpoint(
    pool: &SqlitePool,
    kind: CheckpointKind,
    mode: JournalMode,
) -> Result<CheckpointReport, sqlx::Error> {
    if mode != JournalMode::Wal {
        return Ok(CheckpointReport::skipped(mode));
    }

    let (busy, log, checkpointed): (i64, i64, i64) =
        sqlx::query_as(kind.pragma()).fetch_one(pool).await?;

    Ok(CheckpointReport {
        changes_merged: checkpointed.max(0),
        wal_frames: log.max(0),
        busy: busy != 0,
        mode,
    })
}

/// Result of the shutdown sequence
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointReport>,
    /// Side files still present after close
    #[serde(rename = "lingeringSideFiles")]
    pub lingering_side_files: Vec<PathBuf>,
}

/// Process-wide durability state, present between open and shutdown
struct DurabilityState {
    journal_mode: JournalMode,
    write_through: bool,
    pool: SqlitePool,
    checkpoint_task: Option<JoinHandle<()>>,
}

/// Owner of the live database connection
pub struct DurabilityManager {
    config: DatabaseConfig,
    phase: watch::Sender<LifecyclePhase>,
    state: Mutex<Option<DurabilityState>>,
}

impl DurabilityManager {
    pub fn new(config: DatabaseConfig) -> Self {
        let (phase, _) = watch::channel(LifecyclePhase::Uninitialized);
        Self {
            config,
            phase,
            state: Mutex::new(None),
        }
    }

    /// Path of the live database file
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    fn advance(&self, from: LifecyclePhase, to: LifecyclePhase) -> Result<(), DurabilityError> {
        let current = self.phase();
        if current != from {
            return Err(DurabilityError::InvalidTransition { from: current, to });
        }
        self.phase.send_replace(to);
        tracing::debug!("Database lifecycle: {} -> {}", from, to);
        Ok(())
    }

    /// Open the live connection, tune it, create the schema, and start serving.
    ///
    /// Any failure here leaves the manager unusable; callers treat it as fatal.
    pub async fn open(&self) -> Result<JournalMode, DurabilityError> {
        let mut state = self.state.lock().await;

        self.advance(LifecyclePhase::Uninitialized, LifecyclePhase::Opening)?;
        let mode = select_journal_mode(self.config.journal_mode, self.config.write_through);
        let profile = DurabilityProfile::for_mode(mode);
        tracing::info!(
            "Opening database at {} in {} mode (write-through: {})",
            self.config.path.display(),
            mode,
            self.config.write_through
        );

        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        self.advance(LifecyclePhase::Opening, LifecyclePhase::Tuning)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(profile.connect_options(&self.config.path))
            .await
            .map_err(|source| DurabilityError::Open {
                path: self.config.path.clone(),
                source,
            })?;

        let (effective,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await?;
        if !effective.eq_ignore_ascii_case(mode.as_str()) {
            tracing::warn!(
                "Requested journal mode {} but database reports {}",
                mode,
                effective
            );
        }

        if let Err(e) = initialize_schema(&pool).await {
            pool.close().await;
            return Err(e.into());
        }
        self.advance(LifecyclePhase::Tuning, LifecyclePhase::SchemaReady)?;

        let checkpoint_task = match mode {
            JournalMode::Wal => Some(spawn_checkpoint_scheduler(
                pool.clone(),
                self.config.checkpoint_startup_delay,
                self.config.checkpoint_interval,
            )),
            JournalMode::Truncate => None,
        };

        *state = Some(DurabilityState {
            journal_mode: mode,
            write_through: self.config.write_through,
            pool,
            checkpoint_task,
        });
        self.advance(LifecyclePhase::SchemaReady, LifecyclePhase::Serving)?;
        tracing::info!("Database ready");

        Ok(mode)
    }

    /// The live pool, only while serving
    pub async fn pool(&self) -> Result<SqlitePool, DurabilityError> {
        let phase = self.phase();
        if phase != LifecyclePhase::Serving {
            return Err(DurabilityError::NotServing(phase));
        }

        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.pool.clone())
            .ok_or(DurabilityError::NotServing(phase))
    }

    /// Journal mode in effect, once opened
    pub async fn journal_mode(&self) -> Option<JournalMode> {
        self.state.lock().await.as_ref().map(|s| s.journal_mode)
    }

    /// Whether the database was opened in write-through mode
    pub async fn write_through(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.write_through)
            .unwrap_or(self.config.write_through)
    }

    /// Merge the WAL into the main file and truncate it
    pub async fn checkpoint(&self) -> Result<CheckpointReport, DurabilityError> {
        let phase = self.phase();
        if phase != LifecyclePhase::Serving {
            return Err(DurabilityError::NotServing(phase));
        }

        let (pool, mode) = {
            let state = self.state.lock().await;
            let state = state.as_ref().ok_or(DurabilityError::NotServing(phase))?;
            (state.pool.clone(), state.journal_mode)
        };

        let report = run_checkpoint(&pool, CheckpointKind::Truncate, mode).await?;
        tracing::info!(
            "Manual checkpoint merged {} frames ({} mode)",
            report.changes_merged,
            mode
        );
        Ok(report)
    }

    /// Health of the live database and its side files
    pub async fn health(&self) -> Result<DatabaseHealth, DurabilityError> {
        let pool = self.pool().await.ok();
        let report = DatabaseHealth::collect(
            &self.config.path,
            pool.as_ref(),
            self.config.checkpoint_interval,
        )
        .await?;
        Ok(report)
    }

    /// Ordered teardown of the live connection.
    ///
    /// The caller must already have stopped accepting requests. Steps:
    /// release cached statements, full checkpoint, stop the scheduler, close
    /// the connection, then verify the side files are gone.
    pub async fn shutdown(&self) -> Result<ShutdownReport, DurabilityError> {
        let mut guard = self.state.lock().await;

        self.advance(LifecyclePhase::Serving, LifecyclePhase::Draining)?;
        let Some(mut state) = guard.take() else {
            self.phase.send_replace(LifecyclePhase::Closed);
            return Ok(ShutdownReport {
                checkpoint: None,
                lingering_side_files: Vec::new(),
            });
        };
        tracing::info!("Database draining");

        match state.pool.acquire().await {
            Ok(mut conn) => {
                if let Err(e) = conn.clear_cached_statements().await {
                    tracing::warn!("Failed to release cached statements: {}", e);
                }
            }
            Err(e) => tracing::warn!("Could not acquire connection to release statements: {}", e),
        }

        self.advance(LifecyclePhase::Draining, LifecyclePhase::Checkpointing)?;
        let checkpoint =
            match run_checkpoint(&state.pool, CheckpointKind::Truncate, state.journal_mode).await {
                Ok(report) => {
                    tracing::info!(
                        "Shutdown checkpoint merged {} frames (busy: {})",
                        report.changes_merged,
                        report.busy
                    );
                    Some(report)
                }
                Err(e) => {
                    tracing::error!("Shutdown checkpoint failed: {}", e);
                    None
                }
            };

        if let Some(task) = state.checkpoint_task.take() {
            task.abort();
        }

        state.pool.close().await;
        self.advance(LifecyclePhase::Checkpointing, LifecyclePhase::Closed)?;
        tracing::info!("Database connection closed");

        tokio::time::sleep(SIDE_FILE_GRACE).await;
        let lingering_side_files = lingering_side_files(&self.config.path);
        for path in &lingering_side_files {
            tracing::warn!("Side file still present after close: {}", path.display());
        }

        Ok(ShutdownReport {
            checkpoint,
            lingering_side_files,
        })
    }
}

/// `-wal` and `-shm` files that exist next to the database
pub fn lingering_side_files(db_path: &Path) -> Vec<PathBuf> {
    ["-wal", "-shm"]
        .into_iter()
        .map(|suffix| side_file(db_path, suffix))
        .filter(|p| p.exists())
        .collect()
}

/// Periodic passive checkpoint. Runs until aborted or the pool closes.
fn spawn_checkpoint_scheduler(
    pool: SqlitePool,
    startup_delay: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(startup_delay).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if pool.is_closed() {
                break;
            }

            match run_checkpoint(&pool, CheckpointKind::Passive, JournalMode::Wal).await {
                Ok(report) => tracing::debug!(
                    "Scheduled checkpoint merged {}/{} frames",
                    report.changes_merged,
                    report.wal_frames
                ),
                Err(e) => tracing::warn!("Scheduled checkpoint failed: {}", e),
            }
        }
    })
}

/// Force the process down if shutdown has not finished within `ceiling`.
///
/// Runs on a plain OS thread so a wedged async runtime cannot hold it up.
pub fn arm_shutdown_watchdog(ceiling: Duration) {
    let spawned = std::thread::Builder::new()
        .name("shutdown-watchdog".to_string())
        .spawn(move || {
            std::thread::sleep(ceiling);
            tracing::error!("Shutdown exceeded {:?}, forcing exit", ceiling);
            std::process::exit(1);
        });

    if let Err(e) = spawned {
        tracing::warn!("Failed to arm shutdown watchdog: {}", e);
    }
}
