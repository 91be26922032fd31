// src/store/mod.rs

//! Durable job store.
//!
//! Every piece of leader state that must survive a crash goes through the
//! [`JobStore`] trait: job records, the run record, node pool records and
//! opaque blobs (payloads and job outputs).
//!
//! - [`file`] is the production implementation backed by a directory tree.
//! - [`memory`] is an in-memory implementation for tests.
//! - [`checkpoint`] holds the record types and typed JSON helpers.
//! - [`keys`] defines the key layout, namespaced by run id.

use std::fmt::Debug;
use std::io::Read;

use crate::errors::{StoreError, StoreResult};

pub mod checkpoint;
pub mod file;
pub mod memory;

pub use checkpoint::{NodeRecord, RunRecord};
pub use file::FileJobStore;
pub use memory::MemoryJobStore;

/// Identifier of a blob stored with [`JobStore::put_file`].
pub type FileId = String;

/// Abstract durable key/value + blob store.
///
/// Every operation is atomic for a single key or blob. There are no
/// multi-key transactions: callers must tolerate a crash between two related
/// writes.
pub trait JobStore: Send + Sync + Debug {
    /// Create `key`. Fails with [`StoreError::Conflict`] if it already exists.
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Read `key`. Fails with [`StoreError::NotFound`].
    fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Overwrite an existing `key`. Fails with [`StoreError::Conflict`] if it
    /// does not exist, so a deleted record is never silently resurrected.
    fn update(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Keys stored directly under `prefix` (which must end with `/`).
    fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Store a blob under a fresh id.
    fn put_file(&self, contents: &[u8]) -> StoreResult<FileId>;

    fn read_file(&self, id: &str) -> StoreResult<Box<dyn Read + Send>>;

    fn delete_file(&self, id: &str) -> StoreResult<()>;

    /// Convenience: read a whole blob into memory.
    fn read_file_to_vec(&self, id: &str) -> StoreResult<Vec<u8>> {
        let mut reader = self.read_file(id)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Store key layout.
///
/// ```text
/// runs/<run>/meta           RunRecord
/// runs/<run>/jobs/<job>     Job
/// runs/<run>/nodes/<node>   NodeRecord
/// runs/<run>/report         RunReport
/// files/<id>                blobs
/// ```
pub mod keys {
    pub fn run_meta(run: &str) -> String {
        format!("runs/{run}/meta")
    }

    pub fn run_report(run: &str) -> String {
        format!("runs/{run}/report")
    }

    pub fn job(run: &str, job: &str) -> String {
        format!("runs/{run}/jobs/{job}")
    }

    pub fn nodes_prefix(run: &str) -> String {
        format!("runs/{run}/nodes/")
    }

    pub fn node(run: &str, node: &str) -> String {
        format!("runs/{run}/nodes/{node}")
    }

    pub fn file(id: &str) -> String {
        format!("files/{id}")
    }
}

/// Whether `segment` can be used as one path component of a key.
pub fn is_valid_key_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.starts_with('.')
        && !segment.contains(['/', '\\', '\0'])
}

/// Reject keys that could escape the store root or collide with temp files.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    if key.split('/').all(is_valid_key_segment) {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Same as [`validate_key`] but for a listing prefix ending in `/`.
pub(crate) fn validate_prefix(prefix: &str) -> StoreResult<&str> {
    match prefix.strip_suffix('/') {
        Some(dir) => {
            validate_key(dir)?;
            Ok(dir)
        }
        None => Err(StoreError::InvalidKey(prefix.to_string())),
    }
}
