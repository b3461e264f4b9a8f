//! Conflict copy reconciliation
//!
//! Finds the copies a file-sync client leaves next to `film.db` when two
//! machines edit it concurrently, compares them row by row with the live
//! database and merges newer rows back in:
//! - `scanner`: conflict copy detection
//! - `comparator`: read-only comparison and merge planning
//! - `merge`: transactional application of a merge plan
//! - `orchestrator`: cleanup passes and status reporting

pub mod comparator;
pub mod merge;
pub mod orchestrator;
pub mod patch;
pub mod scanner;
pub mod types;

use std::path::PathBuf;

use thiserror::Error;

pub use comparator::{compare_dbs, diff_table, record_timestamp};
pub use merge::MergeExecutor;
pub use orchestrator::ConflictOrchestrator;
pub use patch::{PatchError, RowPatch};
pub use scanner::{detect_conflict_copies, detect_conflict_copies_of};
pub use types::*;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Cannot open database {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
}
