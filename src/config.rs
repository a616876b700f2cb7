// # Server Configuration
//
// Key-value configuration file handling and database directory resolution.
// The configuration format is whitespace-separated `key value` pairs with
// `#`-prefixed comments; keys are case-insensitive.

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the directory that holds the database
/// location file.
pub const DATABASES_ENV_VAR: &str = "DATABASES";

/// Compiled-in fallback when the environment variable is unset.
pub const DEFAULT_VAR_DIR: &str = "/var/corvusdb";

/// Name of the flat text file mapping database name to volume directory.
pub const DATABASE_LOCATION_FILE: &str = "databases.txt";

/// Server configuration loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Enable the diagnostic shared view
    pub execute_diag: bool,

    /// Slow-query threshold in seconds; below 1 disables tracking
    pub long_query_time: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            execute_diag: false,
            long_query_time: 0,
        }
    }
}

impl ServerConfig {
    /// Whether slow-query tracking is active
    pub fn slow_query_enabled(&self) -> bool {
        self.long_query_time >= 1
    }

    /// Parse a configuration file's contents.
    ///
    /// Unrecognized keys are ignored so the same file can carry settings
    /// for other tools.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config = ServerConfig::default();

        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let key = match fields.next() {
                Some(k) => k,
                None => continue,
            };
            let value = fields.next().ok_or_else(|| {
                DbError::Configuration(format!("line {}: missing value for '{}'", lineno + 1, key))
            })?;

            match key.to_ascii_lowercase().as_str() {
                "execute_diag" => {
                    config.execute_diag = match value.to_ascii_uppercase().as_str() {
                        "ON" => true,
                        "OFF" => false,
                        other => {
                            return Err(DbError::Configuration(format!(
                                "line {}: Execute_diag must be ON or OFF, got '{}'",
                                lineno + 1,
                                other
                            )))
                        }
                    };
                }
                "server_long_query_time" => {
                    config.long_query_time = value.parse::<i64>().map_err(|_| {
                        DbError::Configuration(format!(
                            "line {}: server_long_query_time must be an integer",
                            lineno + 1
                        ))
                    })?;
                }
                _ => {}
            }
        }

        Ok(config)
    }

    /// Load configuration from a file path; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolve the directory holding the database location file.
pub fn var_directory() -> PathBuf {
    match std::env::var(DATABASES_ENV_VAR) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_VAR_DIR),
    }
}

/// Look up a database's volume directory in the location file.
///
/// Each non-comment line is `db_name volume_dir [extra fields...]`.
pub fn resolve_database_dir(db_name: &str) -> Result<PathBuf> {
    let location_file = var_directory().join(DATABASE_LOCATION_FILE);
    let contents = std::fs::read_to_string(&location_file).map_err(|e| {
        DbError::Configuration(format!(
            "cannot read database location file {}: {}",
            location_file.display(),
            e
        ))
    })?;
    resolve_database_dir_in(&contents, db_name)
}

fn resolve_database_dir_in(contents: &str, db_name: &str) -> Result<PathBuf> {
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() == Some(db_name) {
            if let Some(dir) = fields.next() {
                return Ok(PathBuf::from(dir));
            }
        }
    }
    Err(DbError::NotFound(format!("database '{}' is not registered", db_name)))
}
