//! Database configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which engine backs the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// File-backed SQLite with native transactions.
    Native,
    /// Memory-only SQLite made durable through snapshots.
    Web,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Platform {
        if cfg!(target_arch = "wasm32") {
            Platform::Web
        } else {
            Platform::Native
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Native => "native",
            Platform::Web => "web",
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::current()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" => Ok(Platform::Native),
            "web" => Ok(Platform::Web),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

/// Default cap for the encoded key-value backup (4 MiB).
pub const DEFAULT_MAX_BACKUP_BYTES: usize = 4 * 1024 * 1024;

/// Default auto-save period on the web engine.
pub const DEFAULT_AUTO_SAVE_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Engine selection
    pub platform: Platform,
    /// Fixed identifier keying the persisted snapshots
    pub database_name: String,
    /// Database file used by the native engine
    pub database_path: PathBuf,
    /// Directory of the structured snapshot store (web engine).
    /// `None` runs the web engine without persistence.
    pub snapshot_dir: Option<PathBuf>,
    /// Optional pre-seeded database image, probed once on first connect
    pub seed_path: Option<PathBuf>,
    /// Period of the web auto-save task. `None` disables it.
    pub auto_save_interval_ms: Option<u64>,
    /// Save once more when the host tears the database down
    pub save_on_shutdown: bool,
    /// Encoded snapshots above this size are not written to the key-value backup
    pub max_backup_bytes: usize,
}

impl DatabaseConfig {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            platform: Platform::current(),
            database_name: "wordbook.db".to_string(),
            database_path: data_dir.join("wordbook.db"),
            snapshot_dir: Some(data_dir.join("snapshots")),
            seed_path: Some(data_dir.join("seed").join("wordbook.db")),
            auto_save_interval_ms: Some(DEFAULT_AUTO_SAVE_INTERVAL_MS),
            save_on_shutdown: true,
            max_backup_bytes: DEFAULT_MAX_BACKUP_BYTES,
        }
    }

    /// Native engine on a private in-memory database, no persistence.
    pub fn in_memory() -> Self {
        Self {
            platform: Platform::Native,
            database_name: "wordbook.db".to_string(),
            database_path: PathBuf::from(":memory:"),
            snapshot_dir: None,
            seed_path: None,
            auto_save_interval_ms: None,
            save_on_shutdown: false,
            max_backup_bytes: DEFAULT_MAX_BACKUP_BYTES,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn auto_save_interval(&self) -> Option<Duration> {
        self.auto_save_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// File used by the key-value backup store, next to the snapshot directory.
    pub fn backup_file(&self) -> Option<PathBuf> {
        self.snapshot_dir
            .as_ref()
            .map(|dir| dir.join("backup.json"))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new(Path::new(".wordbook"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        assert_eq!("web".parse::<Platform>().unwrap(), Platform::Web);
        assert_eq!("Native".parse::<Platform>().unwrap(), Platform::Native);
        assert!("desktop".parse::<Platform>().is_err());
        assert_eq!(Platform::current(), Platform::Native);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: DatabaseConfig =
            serde_json::from_str(r#"{"platform":"web","auto_save_interval_ms":0}"#).unwrap();
        assert_eq!(config.platform, Platform::Web);
        assert_eq!(config.auto_save_interval(), None);
        assert_eq!(config.max_backup_bytes, DEFAULT_MAX_BACKUP_BYTES);
        assert_eq!(config.database_name, "wordbook.db");
    }

    #[test]
    fn test_paths_follow_data_dir() {
        let config = DatabaseConfig::new(Path::new("/data"));
        assert_eq!(config.database_path, PathBuf::from("/data/wordbook.db"));
        assert_eq!(config.backup_file(), Some(PathBuf::from("/data/snapshots/backup.json")));
    }
}
