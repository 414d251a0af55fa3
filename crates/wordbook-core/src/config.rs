//! Application configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use wordbook_storage::{DatabaseConfig, Platform};

use crate::error::CoreError;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of everything Wordbook writes to disk
    pub data_dir: PathBuf,
    /// Log filter used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Database layer settings
    pub database: DatabaseConfig,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database: DatabaseConfig::new(&data_dir),
            data_dir,
            log_filter: "info".to_string(),
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("Wordbook"))
            .unwrap_or_else(|| PathBuf::from(".wordbook"))
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let db = &self.database;
        if db.database_name.trim().is_empty() {
            return Err(CoreError::Config("database_name must not be empty".to_string()));
        }
        if db.max_backup_bytes == 0 {
            return Err(CoreError::Config("max_backup_bytes must be positive".to_string()));
        }
        if db.platform == Platform::Native && db.database_path.as_os_str().is_empty() {
            return Err(CoreError::Config("database_path must be set for the native engine".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

// Simple dirs implementation for common directories
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}
