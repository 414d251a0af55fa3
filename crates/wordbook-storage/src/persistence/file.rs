//! Structured snapshot store backed by a directory

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Snapshot, SnapshotStore, StoreWrite};
use crate::Result;

/// Keeps one `<key>.sqlite` file per database in `dir`.
///
/// Writes go to a temporary file that is renamed over the previous snapshot,
/// so a crash mid-write leaves the old snapshot intact.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.sqlite", sanitize_key(key)))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self, key: &str) -> Result<Option<Snapshot>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(Snapshot::new(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, snapshot: &Snapshot) -> Result<StoreWrite> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let tmp_path = path.with_extension("sqlite.tmp");
        tokio::fs::write(&tmp_path, snapshot.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(StoreWrite::Saved)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn sanitize_key(key: &str) -> String {
    let name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let name = name.trim_matches('.');
    if name.is_empty() {
        "database".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("snapshots"));

        assert!(store.load("wordbook.db").await.unwrap().is_none());

        let snapshot = Snapshot::new(b"SQLite format 3\0payload".to_vec());
        assert_eq!(
            store.save("wordbook.db", &snapshot).await.unwrap(),
            StoreWrite::Saved
        );

        let loaded = store.load("wordbook.db").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!store.path_for("wordbook.db").with_extension("sqlite.tmp").exists());

        store.clear("wordbook.db").await.unwrap();
        assert!(store.load("wordbook.db").await.unwrap().is_none());
        // Clearing twice is fine
        store.clear("wordbook.db").await.unwrap();
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("wordbook.db"), "wordbook.db");
        assert_eq!(sanitize_key("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_key(".."), "database");
    }
}
