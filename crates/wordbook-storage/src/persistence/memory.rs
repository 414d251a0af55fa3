//! In-process snapshot store

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{Snapshot, SnapshotStore, StoreWrite};
use crate::Result;

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.read().get(key).cloned())
    }

    async fn save(&self, key: &str, snapshot: &Snapshot) -> Result<StoreWrite> {
        self.snapshots
            .write()
            .insert(key.to_string(), snapshot.clone());
        Ok(StoreWrite::Saved)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.snapshots.write().remove(key);
        Ok(())
    }
}
