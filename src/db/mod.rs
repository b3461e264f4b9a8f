//! Database module for SQLite persistence
//!
//! Owns the live connection lifecycle, the schema, and the row model used
//! when reconciling conflict copies.

mod durability;
mod health;
mod row;
mod schema;
mod tables;

pub use durability::*;
pub use health::*;
pub use row::*;
pub use schema::*;
pub use tables::*;

use std::path::{Path, PathBuf};

/// Path of a side file SQLite keeps next to the database (`-wal`, `-shm`, `-journal`)
pub fn side_file(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
