use async_std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

use crate::raft::error::StorageError;
use crate::raft::types::{Entry, HardState, SnapshotMeta};

// Durable storage for log entries.
#[async_trait]
pub trait LogStore: Send + Sync {
    // Returns the lowest stored index, or 0 if the store is empty.
    async fn first_index(&self) -> Result<u64, StorageError>;

    // Returns the highest stored index, or 0 if the store is empty.
    async fn last_index(&self) -> Result<u64, StorageError>;

    async fn get(&self, index: u64) -> Result<Option<Entry>, StorageError>;

    async fn store(&self, entries: &[Entry]) -> Result<(), StorageError>;

    // Removes all entries with indexes in [min, max].
    async fn delete_range(&self, min: u64, max: u64) -> Result<(), StorageError>;
}

// Durable storage for the current term and vote.
#[async_trait]
pub trait StableStore: Send + Sync {
    async fn save(&self, state: &HardState) -> Result<(), StorageError>;
    async fn load(&self) -> Result<Option<HardState>, StorageError>;
}

// Durable storage for state machine snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn create(&self, meta: &SnapshotMeta, data: Bytes) -> Result<(), StorageError>;

    // Returns the metadata of all retained snapshots, newest first.
    async fn list(&self) -> Result<Vec<SnapshotMeta>, StorageError>;

    // Returns the newest snapshot along with its contents.
    async fn latest(&self) -> Result<Option<(SnapshotMeta, Bytes)>, StorageError>;
}

pub struct MemoryLogStore {
    entries: Mutex<BTreeMap<u64, Entry>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        MemoryLogStore {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn first_index(&self) -> Result<u64, StorageError> {
        Ok(self.entries.lock().await.keys().next().copied().unwrap_or(0))
    }

    async fn last_index(&self) -> Result<u64, StorageError> {
        Ok(self.entries.lock().await.keys().next_back().copied().unwrap_or(0))
    }

    async fn get(&self, index: u64) -> Result<Option<Entry>, StorageError> {
        Ok(self.entries.lock().await.get(&index).cloned())
    }

    async fn store(&self, entries: &[Entry]) -> Result<(), StorageError> {
        let mut locked = self.entries.lock().await;
        for entry in entries {
            locked.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    async fn delete_range(&self, min: u64, max: u64) -> Result<(), StorageError> {
        if min > max {
            return Ok(());
        }
        let mut locked = self.entries.lock().await;
        let doomed: Vec<u64> = locked.range(min..=max).map(|(k, _)| *k).collect();
        for index in doomed {
            locked.remove(&index);
        }
        Ok(())
    }
}

pub struct MemoryStableStore {
    state: Mutex<Option<HardState>>,
}

impl MemoryStableStore {
    pub fn new() -> Self {
        MemoryStableStore {
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StableStore for MemoryStableStore {
    async fn save(&self, state: &HardState) -> Result<(), StorageError> {
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<HardState>, StorageError> {
        Ok(self.state.lock().await.clone())
    }
}

// Keeps the newest "retain" snapshots in memory.
pub struct MemorySnapshotStore {
    retain: usize,
    snapshots: Mutex<Vec<(SnapshotMeta, Bytes)>>,
}

impl MemorySnapshotStore {
    pub fn new(retain: usize) -> Self {
        MemorySnapshotStore {
            retain: retain.max(1),
            snapshots: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn create(&self, meta: &SnapshotMeta, data: Bytes) -> Result<(), StorageError> {
        let mut locked = self.snapshots.lock().await;
        locked.push((meta.clone(), data));
        locked.sort_by(|(a, _), (b, _)| b.last().cmp(&a.last()));
        locked.truncate(self.retain);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SnapshotMeta>, StorageError> {
        Ok(self
            .snapshots
            .lock()
            .await
            .iter()
            .map(|(meta, _)| meta.clone())
            .collect())
    }

    async fn latest(&self) -> Result<Option<(SnapshotMeta, Bytes)>, StorageError> {
        Ok(self.snapshots.lock().await.first().cloned())
    }
}
