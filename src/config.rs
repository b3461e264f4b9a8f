//! Configuration management for Film Gallery Server

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::JournalMode;

/// File name of the primary database inside the data directory
pub const DB_FILE_NAME: &str = "film.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Resolved path of the live database file
    pub path: PathBuf,
    /// Prefer single-file truncate journaling over write-ahead logging
    pub write_through: bool,
    /// Explicit journal mode, wins over `write_through` when set
    pub journal_mode: Option<JournalMode>,
    /// Interval between passive checkpoints while serving
    pub checkpoint_interval: Duration,
    /// Delay before the first scheduled checkpoint
    pub checkpoint_startup_delay: Duration,
    /// Hard ceiling on the shutdown sequence
    pub shutdown_watchdog: Duration,
}

impl DatabaseConfig {
    /// Directory holding the live database and any conflict copies
    pub fn data_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("./data").join(DB_FILE_NAME),
            write_through: false,
            journal_mode: None,
            checkpoint_interval: Duration::from_secs(5 * 60),
            checkpoint_startup_delay: Duration::from_secs(5),
            shutdown_watchdog: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 4000,
            },
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = DatabaseConfig::default();

        let journal_mode = match env::var("FILM_DB_JOURNAL_MODE") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                raw.parse::<JournalMode>()
                    .map_err(|_| ConfigError::Invalid("FILM_DB_JOURNAL_MODE", raw))?,
            ),
            _ => None,
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "4000".to_string())
                    .parse()
                    .unwrap_or(4000),
            },
            database: DatabaseConfig {
                path: resolve_db_path(
                    env::var_os("FILM_DB_PATH").map(PathBuf::from),
                    env::var_os("FILM_DATA_ROOT").map(PathBuf::from),
                    env::var_os("FILM_USER_DATA").map(PathBuf::from),
                ),
                write_through: env_flag("FILM_DB_WRITE_THROUGH"),
                journal_mode,
                checkpoint_interval: env_secs("FILM_CHECKPOINT_INTERVAL_SECS")
                    .unwrap_or(defaults.checkpoint_interval),
                checkpoint_startup_delay: env_secs("FILM_CHECKPOINT_DELAY_SECS")
                    .unwrap_or(defaults.checkpoint_startup_delay),
                shutdown_watchdog: env_secs("FILM_SHUTDOWN_WATCHDOG_SECS")
                    .unwrap_or(defaults.shutdown_watchdog),
            },
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Resolve the live database path.
///
/// Precedence: explicit file path, then `<data root>/data`, then
/// `<user data>/data`, then `./data`. The file name is always
/// [`DB_FILE_NAME`] unless an explicit path is given.
pub fn resolve_db_path(
    explicit: Option<PathBuf>,
    data_root: Option<PathBuf>,
    user_data: Option<PathBuf>,
) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }

    let dir = data_root
        .or(user_data)
        .map(|root| root.join("data"))
        .unwrap_or_else(|| PathBuf::from("./data"));

    dir.join(DB_FILE_NAME)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_secs(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let path = resolve_db_path(
            Some(PathBuf::from("/tmp/custom.db")),
            Some(PathBuf::from("/srv/root")),
            Some(PathBuf::from("/home/me/.config/film")),
        );
        assert_eq!(path, PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn test_data_root_before_user_data() {
        let path = resolve_db_path(
            None,
            Some(PathBuf::from("/srv/root")),
            Some(PathBuf::from("/home/me/.config/film")),
        );
        assert_eq!(path, PathBuf::from("/srv/root/data/film.db"));

        let path = resolve_db_path(None, None, Some(PathBuf::from("/home/me/.config/film")));
        assert_eq!(path, PathBuf::from("/home/me/.config/film/data/film.db"));
    }

    #[test]
    fn test_default_path() {
        let path = resolve_db_path(None, None, None);
        assert_eq!(path, PathBuf::from("./data/film.db"));
    }

    #[test]
    fn test_data_dir_is_parent() {
        let config = DatabaseConfig {
            path: PathBuf::from("/srv/root/data/film.db"),
            ..Default::default()
        };
        assert_eq!(config.data_dir(), Path::new("/srv/root/data"));
    }
}
