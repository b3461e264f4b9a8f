//! Tables reconciled across conflict copies
//!
//! Each table carries an explicit whitelist of writable columns. Merge
//! statements are only ever built from these names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A table whose rows are reconciled between the live database and a conflict copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciledTable {
    Films,
    Rolls,
    Photos,
}

impl ReconciledTable {
    /// All reconciled tables, parents before children
    pub const ALL: [ReconciledTable; 3] = [
        ReconciledTable::Films,
        ReconciledTable::Rolls,
        ReconciledTable::Photos,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ReconciledTable::Films => "films",
            ReconciledTable::Rolls => "rolls",
            ReconciledTable::Photos => "photos",
        }
    }

    /// Writable columns, excluding the `id` primary key
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            ReconciledTable::Films => &[
                "name",
                "brand",
                "iso",
                "format",
                "process",
                "created_at",
                "updated_at",
            ],
            ReconciledTable::Rolls => &[
                "title",
                "film_id",
                "camera",
                "lens",
                "start_date",
                "end_date",
                "location",
                "notes",
                "cover_path",
                "created_at",
                "updated_at",
            ],
            ReconciledTable::Photos => &[
                "roll_id",
                "frame_number",
                "caption",
                "taken_at",
                "aperture",
                "shutter_speed",
                "rating",
                "full_rel_path",
                "thumb_rel_path",
                "created_at",
                "updated_at",
            ],
        }
    }

    /// Canonical spelling of a whitelisted column, if the table has it
    pub fn column(self, name: &str) -> Option<&'static str> {
        self.columns().iter().copied().find(|c| *c == name)
    }

    /// `SELECT` covering every row of the table
    pub fn select_all_sql(self) -> String {
        format!("SELECT * FROM {} ORDER BY id", self.name())
    }
}

impl fmt::Display for ReconciledTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReconciledTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReconciledTable::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| format!("unknown table: {}", s))
    }
}
