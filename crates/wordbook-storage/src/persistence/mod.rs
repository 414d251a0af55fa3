//! Snapshot persistence for the memory-only web engine
//!
//! The web engine keeps the whole database in memory. To survive a reload,
//! full binary snapshots are written to two independent stores keyed by the
//! database name:
//!
//! - a structured store that holds arbitrarily large blobs (primary)
//! - a key-value store holding a size-capped, encoded copy (fallback)
//!
//! Writes go to both stores independently. A failure in one store is logged
//! and does not fail the save as long as the other store took the snapshot.
//! There is no cross-store consistency: this is a reload cache, not a source
//! of truth.

pub mod autosave;
pub mod file;
pub mod kv;
pub mod memory;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::error::StorageError;
use crate::Result;

pub use autosave::AutoSaveController;
pub use file::FileSnapshotStore;
pub use kv::{JsonFileBackend, KeyValueBackend, KeyValueSnapshotStore, MemoryBackend};
pub use memory::MemorySnapshotStore;

/// Immutable full export of a database at a point in time.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    bytes: Arc<[u8]>,
}

impl Snapshot {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::from(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn sha256_hex(&self) -> String {
        format!("{:x}", Sha256::digest(&self.bytes))
    }
}

impl From<Vec<u8>> for Snapshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("len", &self.len())
            .finish()
    }
}

/// Result of a single store write that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Saved,
    /// The store declined the snapshot, e.g. because it exceeds its size cap.
    Skipped(String),
}

/// A durable place to keep snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn load(&self, key: &str) -> Result<Option<Snapshot>>;

    async fn save(&self, key: &str, snapshot: &Snapshot) -> Result<StoreWrite>;

    async fn clear(&self, key: &str) -> Result<()>;
}

/// Per-store outcome of a dual write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    Saved,
    Skipped(String),
    Failed(String),
}

impl StoreStatus {
    pub fn is_saved(&self) -> bool {
        matches!(self, StoreStatus::Saved)
    }
}

impl From<Result<StoreWrite>> for StoreStatus {
    fn from(result: Result<StoreWrite>) -> Self {
        match result {
            Ok(StoreWrite::Saved) => StoreStatus::Saved,
            Ok(StoreWrite::Skipped(reason)) => StoreStatus::Skipped(reason),
            Err(e) => StoreStatus::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub bytes: usize,
    pub primary: StoreStatus,
    pub fallback: StoreStatus,
}

impl PersistReport {
    pub fn any_saved(&self) -> bool {
        self.primary.is_saved() || self.fallback.is_saved()
    }
}

/// Dual-store snapshot persistence.
#[derive(Debug, Clone)]
pub struct SnapshotPersistence {
    key: String,
    primary: Arc<dyn SnapshotStore>,
    fallback: Arc<dyn SnapshotStore>,
}

impl SnapshotPersistence {
    pub fn new(
        key: impl Into<String>,
        primary: Arc<dyn SnapshotStore>,
        fallback: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            key: key.into(),
            primary,
            fallback,
        }
    }

    /// Both stores in process memory. Used by tests and ephemeral hosts.
    pub fn in_memory(key: impl Into<String>, max_backup_bytes: usize) -> Self {
        Self::new(
            key,
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(KeyValueSnapshotStore::new(
                MemoryBackend::new(),
                max_backup_bytes,
            )),
        )
    }

    /// Stores described by `config`, or `None` when persistence is off.
    pub fn from_config(config: &DatabaseConfig) -> Option<Self> {
        let dir = config.snapshot_dir.as_ref()?;
        let backup_file = config.backup_file()?;
        Some(Self::new(
            config.database_name.clone(),
            Arc::new(FileSnapshotStore::new(dir)),
            Arc::new(KeyValueSnapshotStore::new(
                JsonFileBackend::new(backup_file),
                config.max_backup_bytes,
            )),
        ))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Loads the newest snapshot, trying the primary store first.
    ///
    /// Returns `Ok(None)` when neither store has data. Fails only when both
    /// stores failed to read, which callers treat as "persistence
    /// unavailable".
    pub async fn load_existing(&self) -> Result<Option<Snapshot>> {
        let primary_err = match self.primary.load(&self.key).await {
            Ok(Some(snapshot)) if !snapshot.is_empty() => {
                tracing::debug!(
                    store = self.primary.name(),
                    bytes = snapshot.len(),
                    "Loaded snapshot"
                );
                return Ok(Some(snapshot));
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(store = self.primary.name(), error = %e, "Snapshot load failed");
                Some(e)
            }
        };

        match self.fallback.load(&self.key).await {
            Ok(Some(snapshot)) if !snapshot.is_empty() => {
                tracing::info!(
                    store = self.fallback.name(),
                    bytes = snapshot.len(),
                    "Loaded snapshot from fallback store"
                );
                Ok(Some(snapshot))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!(store = self.fallback.name(), error = %e, "Snapshot load failed");
                match primary_err {
                    Some(primary_err) => Err(StorageError::Persistence(format!(
                        "no snapshot store readable ({}; {})",
                        primary_err, e
                    ))),
                    None => Ok(None),
                }
            }
        }
    }

    /// Writes `snapshot` to both stores independently.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<PersistReport> {
        let (primary, fallback) = tokio::join!(
            self.primary.save(&self.key, snapshot),
            self.fallback.save(&self.key, snapshot)
        );

        let report = PersistReport {
            bytes: snapshot.len(),
            primary: primary.into(),
            fallback: fallback.into(),
        };

        for (store, status) in [
            (self.primary.name(), &report.primary),
            (self.fallback.name(), &report.fallback),
        ] {
            match status {
                StoreStatus::Saved => {}
                StoreStatus::Skipped(reason) => {
                    tracing::debug!(store, reason = %reason, "Snapshot store skipped save")
                }
                StoreStatus::Failed(error) => {
                    tracing::warn!(store, error = %error, "Snapshot store save failed")
                }
            }
        }

        if report.any_saved() {
            Ok(report)
        } else {
            Err(StorageError::Persistence(format!(
                "snapshot not saved to any store ({:?}; {:?})",
                report.primary, report.fallback
            )))
        }
    }

    /// Removes the persisted snapshot from both stores.
    pub async fn clear(&self) -> Result<()> {
        let (primary, fallback) = tokio::join!(
            self.primary.clear(&self.key),
            self.fallback.clear(&self.key)
        );
        primary?;
        fallback?;
        Ok(())
    }
}
