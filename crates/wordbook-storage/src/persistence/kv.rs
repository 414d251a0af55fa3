//! Key-value fallback store
//!
//! Mirrors how a browser keeps a small backup in `localStorage`: the snapshot
//! is base64-encoded into a JSON envelope and stored as a string under
//! `<key>_backup`. Key-value stores have tight quotas, so envelopes above the
//! configured cap are not written at all.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Snapshot, SnapshotStore, StoreWrite};
use crate::Result;

const ENVELOPE_FORMAT: u32 = 1;

/// A string key-value store, shaped like `localStorage`.
#[async_trait]
pub trait KeyValueBackend: Send + Sync + fmt::Debug {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_item(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupEnvelope {
    format: u32,
    sha256: String,
    data: String,
}

#[derive(Debug)]
pub struct KeyValueSnapshotStore<B> {
    backend: B,
    max_encoded_bytes: usize,
}

impl<B: KeyValueBackend> KeyValueSnapshotStore<B> {
    pub fn new(backend: B, max_encoded_bytes: usize) -> Self {
        Self {
            backend,
            max_encoded_bytes,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn item_key(key: &str) -> String {
        format!("{}_backup", key)
    }
}

#[async_trait]
impl<B: KeyValueBackend> SnapshotStore for KeyValueSnapshotStore<B> {
    fn name(&self) -> &'static str {
        "key-value"
    }

    async fn load(&self, key: &str) -> Result<Option<Snapshot>> {
        let Some(raw) = self.backend.get_item(&Self::item_key(key)).await? else {
            return Ok(None);
        };

        let envelope: BackupEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable snapshot backup");
                return Ok(None);
            }
        };

        if envelope.format != ENVELOPE_FORMAT {
            tracing::warn!(format = envelope.format, "Discarding snapshot backup of unknown format");
            return Ok(None);
        }

        let bytes = match STANDARD.decode(envelope.data.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable snapshot backup");
                return Ok(None);
            }
        };

        let snapshot = Snapshot::new(bytes);
        if snapshot.sha256_hex() != envelope.sha256 {
            tracing::warn!("Discarding snapshot backup with checksum mismatch");
            return Ok(None);
        }

        Ok(Some(snapshot))
    }

    async fn save(&self, key: &str, snapshot: &Snapshot) -> Result<StoreWrite> {
        let envelope = BackupEnvelope {
            format: ENVELOPE_FORMAT,
            sha256: snapshot.sha256_hex(),
            data: STANDARD.encode(snapshot.as_bytes()),
        };
        let encoded = serde_json::to_string(&envelope)?;
        let item_key = Self::item_key(key);

        if encoded.len() > self.max_encoded_bytes {
            // An older, smaller backup would resurrect stale data on the next load.
            self.backend.remove_item(&item_key).await?;
            return Ok(StoreWrite::Skipped(format!(
                "encoded snapshot is {} bytes, cap is {}",
                encoded.len(),
                self.max_encoded_bytes
            )));
        }

        self.backend.set_item(&item_key, &encoded).await?;
        Ok(StoreWrite::Saved)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.backend.remove_item(&Self::item_key(key)).await
    }
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// A single JSON object file holding every item.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the file
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_items(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_items(&self, items: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec(items)?).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for JsonFileBackend {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_items().await?.remove(key))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut items = self.read_items().await?;
        items.insert(key.to_string(), value.to_string());
        self.write_items(&items).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut items = self.read_items().await?;
        if items.remove(key).is_some() {
            self.write_items(&items).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_through_envelope() {
        let store = KeyValueSnapshotStore::new(MemoryBackend::new(), 1024);
        let snapshot = Snapshot::new(vec![0, 1, 2, 250, 251]);

        assert_eq!(store.save("db", &snapshot).await.unwrap(), StoreWrite::Saved);
        assert!(store.backend().get_item("db_backup").await.unwrap().is_some());

        let loaded = store.load("db").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_oversized_save_is_skipped_and_drops_stale_backup() {
        let store = KeyValueSnapshotStore::new(MemoryBackend::new(), 200);
        store.save("db", &Snapshot::new(vec![1; 8])).await.unwrap();
        assert_eq!(store.backend().len(), 1);

        let outcome = store.save("db", &Snapshot::new(vec![2; 400])).await.unwrap();
        assert!(matches!(outcome, StoreWrite::Skipped(_)));
        assert!(store.backend().is_empty());
        assert!(store.load("db").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_backup_is_a_miss() {
        let store = KeyValueSnapshotStore::new(MemoryBackend::new(), 1024);
        store.backend().set_item("db_backup", "not json").await.unwrap();
        assert!(store.load("db").await.unwrap().is_none());

        let tampered = serde_json::to_string(&BackupEnvelope {
            format: ENVELOPE_FORMAT,
            sha256: "0".repeat(64),
            data: STANDARD.encode([1, 2, 3]),
        })
        .unwrap();
        store.backend().set_item("db_backup", &tampered).await.unwrap();
        assert!(store.load("db").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_backend_persists_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("backup.json");

        let backend = JsonFileBackend::new(&path);
        assert!(backend.get_item("a").await.unwrap().is_none());
        backend.set_item("a", "1").await.unwrap();
        backend.set_item("b", "2").await.unwrap();

        let reopened = JsonFileBackend::new(&path);
        assert_eq!(reopened.get_item("a").await.unwrap().as_deref(), Some("1"));

        reopened.remove_item("a").await.unwrap();
        assert!(backend.get_item("a").await.unwrap().is_none());
        assert_eq!(backend.get_item("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_json_file_backend_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(JsonFileBackend::new(dir.path().join("backup.json")));

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let backend = std::sync::Arc::clone(&backend);
                tokio::spawn(async move {
                    backend.set_item(&format!("k{}", i), "v").await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        for i in 0..8 {
            assert!(backend.get_item(&format!("k{}", i)).await.unwrap().is_some());
        }
    }
}
