// src/store/memory.rs

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use super::{FileId, JobStore, keys, validate_key, validate_prefix};
use crate::errors::{StoreError, StoreResult};

/// In-memory job store.
///
/// Clones share the same underlying map, so a test can drop a leader,
/// "restart" it against a clone, and observe exactly what was checkpointed.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the current contents, detached from this store.
    pub fn snapshot(&self) -> MemoryJobStore {
        let entries = self.lock().clone();
        MemoryJobStore {
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    /// All keys currently stored (blobs included).
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let mut entries = self.lock();
        if entries.contains_key(key) {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                reason: "create of an existing key",
            });
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        validate_key(key)?;
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn update(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(slot) => {
                *slot = value.to_vec();
                Ok(())
            }
            None => Err(StoreError::Conflict {
                key: key.to_string(),
                reason: "update of a missing key",
            }),
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.lock().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        Ok(self.lock().contains_key(key))
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        validate_prefix(prefix)?;
        Ok(self
            .lock()
            .keys()
            .filter(|k| {
                k.strip_prefix(prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }

    fn put_file(&self, contents: &[u8]) -> StoreResult<FileId> {
        let id = Uuid::new_v4().to_string();
        self.lock().insert(keys::file(&id), contents.to_vec());
        Ok(id)
    }

    fn read_file(&self, id: &str) -> StoreResult<Box<dyn Read + Send>> {
        let bytes = self.get(&keys::file(id))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn delete_file(&self, id: &str) -> StoreResult<()> {
        self.delete(&keys::file(id))
    }
}
