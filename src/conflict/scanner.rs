//! Conflict copy detection
//!
//! The sync client names its copies `<base>-<hostname>.<ext>` next to the
//! original, where `<base>.<ext>` is the live database file name.

use std::path::Path;

use chrono::{DateTime, Utc};

use super::types::ConflictFile;
use crate::config::DB_FILE_NAME;

/// List conflict copies of `film.db` in `data_dir`, newest first.
///
/// A missing or unreadable directory yields no conflicts.
pub fn detect_conflict_copies(data_dir: &Path) -> Vec<ConflictFile> {
    detect_conflict_copies_of(data_dir, DB_FILE_NAME)
}

/// List conflict copies of `db_file_name` in `data_dir`, newest first
pub fn detect_conflict_copies_of(data_dir: &Path, db_file_name: &str) -> Vec<ConflictFile> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("Data directory {} does not exist", data_dir.display());
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!("Cannot scan {} for conflict copies: {}", data_dir.display(), e);
            return Vec::new();
        }
    };

    let mut found = Vec::new();

    for entry in entries.flatten() {
        let filename = entry.file_name().to_string_lossy().into_owned();
        let Some(origin_hostname) = conflict_hostname(&filename, db_file_name).map(str::to_string)
        else {
            continue;
        };

        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Cannot stat conflict copy {}: {}", filename, e);
                continue;
            }
        };

        let modified_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));

        found.push(ConflictFile {
            path: entry.path(),
            filename,
            origin_hostname,
            modified_time,
            size_bytes: meta.len(),
        });
    }

    found.sort_by(|a, b| {
        b.modified_time
            .cmp(&a.modified_time)
            .then_with(|| a.filename.cmp(&b.filename))
    });

    if !found.is_empty() {
        tracing::info!(
            "Found {} conflict cop{} in {}",
            found.len(),
            if found.len() == 1 { "y" } else { "ies" },
            data_dir.display()
        );
    }

    found
}

/// Host name part of a conflict copy name, if `filename` is one
fn conflict_hostname<'a>(filename: &'a str, db_file_name: &str) -> Option<&'a str> {
    let (base, ext) = db_file_name.rsplit_once('.')?;

    let hostname = filename
        .strip_prefix(base)?
        .strip_prefix('-')?
        .strip_suffix(ext)?
        .strip_suffix('.')?;

    let valid = !hostname.is_empty()
        && hostname
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ' | '(' | ')'));

    valid.then_some(hostname)
}
