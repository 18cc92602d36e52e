use async_std::sync::{RwLock, RwLockWriteGuard};
use std::collections::HashMap;

// An in-memory map from string keys to string values. Readers share the lock,
// writers hold it exclusively.
pub struct KeyStore {
    data: RwLock<HashMap<String, String>>,
}

impl KeyStore {
    pub fn new() -> Self {
        KeyStore {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.data.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: String, value: String) {
        self.data.write().await.insert(key, value);
    }

    // Removing an absent key is not an error.
    pub async fn delete(&self, key: &str) {
        self.data.write().await.remove(key);
    }

    // Returns a copy of all entries, taken at a single instant.
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.data.read().await.clone()
    }

    // Replaces all entries with the supplied ones.
    pub async fn restore(&self, entries: HashMap<String, String>) {
        *self.data.write().await = entries;
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    // Grants exclusive access, for callers which need to do more than a
    // single mutation atomically.
    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.data.write().await
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        KeyStore::new()
    }
}
