//! Database schema initialization

use sqlx::{Executor, Sqlite};

/// Create tables and indexes if absent. Safe to run on every start.
pub async fn initialize_schema<'e, E>(executor: E) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    executor.execute(SCHEMA_SQL).await?;
    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Film stocks
CREATE TABLE IF NOT EXISTS films (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    brand TEXT,
    iso INTEGER,
    format TEXT,
    process TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Rolls shot on a camera
CREATE TABLE IF NOT EXISTS rolls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    film_id INTEGER REFERENCES films(id) ON DELETE SET NULL,
    camera TEXT,
    lens TEXT,
    start_date TEXT,
    end_date TEXT,
    location TEXT,
    notes TEXT,
    cover_path TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_rolls_film_id ON rolls(film_id);
CREATE INDEX IF NOT EXISTS idx_rolls_start_date ON rolls(start_date);

-- Frames within a roll
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    roll_id INTEGER NOT NULL REFERENCES rolls(id) ON DELETE CASCADE,
    frame_number TEXT,
    caption TEXT,
    taken_at TEXT,
    aperture REAL,
    shutter_speed TEXT,
    rating INTEGER,
    full_rel_path TEXT,
    thumb_rel_path TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_photos_roll_id ON photos(roll_id);
"#;
