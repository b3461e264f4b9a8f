//! Conflict reconciliation data types
//!
//! Defines types for reconciling sync-client conflict copies including:
//! - Conflict copies found on disk
//! - Per-table comparison results and merge plans
//! - Merge outcomes and cleanup reports

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{ReconciledTable, Row};

/// A conflict copy of the database created by the sync client
#[derive(Debug, Clone, Serialize)]
pub struct ConflictFile {
    pub path: PathBuf,
    pub filename: String,
    /// Host name the sync client appended to the copy
    #[serde(rename = "originHostname")]
    pub origin_hostname: String,
    #[serde(rename = "modifiedTime")]
    pub modified_time: DateTime<Utc>,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
}

/// Rows of one table of one database file, keyed by row id
pub type TableSnapshot = BTreeMap<String, Row>;

/// Per-table comparison summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictInfo {
    pub table: ReconciledTable,
    #[serde(rename = "onlyInMainCount")]
    pub only_in_main_count: usize,
    #[serde(rename = "onlyInConflictCount")]
    pub only_in_conflict_count: usize,
    #[serde(rename = "inBothCount")]
    pub in_both_count: usize,
    #[serde(rename = "toImportCount")]
    pub to_import_count: usize,
    #[serde(rename = "toUpdateCount")]
    pub to_update_count: usize,
    #[serde(rename = "needsMerge")]
    pub needs_merge: bool,
}

/// A row the conflict copy contributes to the live database
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordToMerge {
    pub table: ReconciledTable,
    /// Present for updates of an existing row, absent for inserts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub record: Row,
}

impl RecordToMerge {
    pub fn is_update(&self) -> bool {
        self.id.is_some()
    }
}

/// Full result of comparing the live database with one conflict copy
#[derive(Debug, Clone, Default)]
pub struct ComparisonResult {
    pub main: BTreeMap<ReconciledTable, TableSnapshot>,
    pub conflict: BTreeMap<ReconciledTable, TableSnapshot>,
    pub conflicts: Vec<ConflictInfo>,
    pub records_to_merge: Vec<RecordToMerge>,
}

impl ComparisonResult {
    /// Whether any table has rows to import or update
    pub fn needs_merge(&self) -> bool {
        self.conflicts.iter().any(|c| c.needs_merge)
    }
}

/// Running tally of a merge transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeTally {
    pub succeeded: usize,
    pub failed: usize,
}

impl MergeTally {
    pub fn record(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Outcome of one merge attempt against one conflict copy
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeResult {
    pub merged: bool,
    /// Safe to archive the conflict copy
    pub safe: bool,
    #[serde(rename = "recordsMerged", skip_serializing_if = "Option::is_none")]
    pub records_merged: Option<usize>,
    #[serde(rename = "recordsFailed", skip_serializing_if = "Option::is_none")]
    pub records_failed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<ConflictInfo>>,
    #[serde(rename = "needsManualReview", skip_serializing_if = "Option::is_none")]
    pub needs_manual_review: Option<bool>,
    #[serde(rename = "recordsToMerge", skip_serializing_if = "Option::is_none")]
    pub records_to_merge: Option<Vec<RecordToMerge>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MergeResult {
    /// Nothing to merge; the copy can be archived as-is
    pub fn nothing_to_merge(conflicts: Vec<ConflictInfo>) -> Self {
        Self {
            merged: false,
            safe: true,
            conflicts: Some(conflicts),
            ..Default::default()
        }
    }

    /// Merge plan computed but not applied
    pub fn preview(conflicts: Vec<ConflictInfo>, records_to_merge: Vec<RecordToMerge>) -> Self {
        Self {
            merged: false,
            safe: false,
            conflicts: Some(conflicts),
            needs_manual_review: Some(true),
            records_to_merge: Some(records_to_merge),
            ..Default::default()
        }
    }

    /// Transaction committed
    pub fn committed(tally: MergeTally, conflicts: Vec<ConflictInfo>) -> Self {
        Self {
            merged: true,
            safe: true,
            records_merged: Some(tally.succeeded),
            records_failed: Some(tally.failed),
            conflicts: Some(conflicts),
            ..Default::default()
        }
    }

    /// Merge failed; leave the copy in place
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            merged: false,
            safe: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn needs_manual_review(&self) -> bool {
        self.needs_manual_review.unwrap_or(false)
    }
}

/// What cleanup did with a conflict copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Rows merged, copy renamed to `.merged`
    Merged,
    /// Nothing new, copy renamed to `.bak`
    Archived,
    /// Merge plan needs a human, copy untouched
    ManualReview,
    /// Merge failed, copy untouched for the next pass
    Failed,
    /// Merge outcome known but the rename kept failing
    ArchiveFailed,
}

/// Cleanup result for one conflict copy
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub filename: String,
    pub disposition: Disposition,
    #[serde(rename = "archivedAs", skip_serializing_if = "Option::is_none")]
    pub archived_as: Option<PathBuf>,
    pub result: MergeResult,
}

/// Summary of one cleanup pass
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    #[serde(rename = "passId")]
    pub pass_id: String,
    /// Conflict copies found
    pub found: usize,
    pub outcomes: Vec<FileOutcome>,
}

impl CleanupReport {
    pub fn count(&self, disposition: Disposition) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.disposition == disposition)
            .count()
    }
}

/// Read-only analysis of one conflict copy
#[derive(Debug, Clone, Serialize)]
pub struct ConflictDetail {
    pub filename: String,
    #[serde(rename = "originHostname")]
    pub origin_hostname: String,
    #[serde(rename = "modifiedTime")]
    pub modified_time: DateTime<Utc>,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    pub analysis: Vec<ConflictInfo>,
    #[serde(rename = "needsMerge")]
    pub needs_merge: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Conflict copies present in the data directory
#[derive(Debug, Clone, Serialize)]
pub struct ConflictStatus {
    #[serde(rename = "hasConflicts")]
    pub has_conflicts: bool,
    pub conflicts: Vec<ConflictDetail>,
}
