// src/store/file.rs

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, trace};
use uuid::Uuid;

use super::{FileId, JobStore, keys, validate_key, validate_prefix};
use crate::errors::{StoreError, StoreResult};

/// Job store backed by a local directory.
///
/// Each key maps to one file below `root`. Writes go to a hidden temporary
/// sibling first and are then renamed into place, so readers see either the
/// old or the new record, never a torn one.
#[derive(Debug)]
pub struct FileJobStore {
    root: PathBuf,
    /// Serializes the exists-check and the write of `put`/`update`.
    write_lock: Mutex<()>,
}

impl FileJobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened file job store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned lock only means another writer panicked; the files on
        // disk are still consistent thanks to write-then-rename.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Write `contents` to `path` atomically (temp file + fsync + rename).
fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    trace!(path = %path.display(), bytes = contents.len(), "atomic write");
    Ok(())
}

fn not_found_as(key: &str, err: std::io::Error) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io(err)
    }
}

impl JobStore for FileJobStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.lock();
        if path.exists() {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                reason: "create of an existing key",
            });
        }
        write_atomic(&path, value)
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| not_found_as(key, e))
    }

    fn update(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.lock();
        if !path.exists() {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                reason: "update of a missing key",
            });
        }
        write_atomic(&path, value)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let dir = validate_prefix(prefix)?;
        let entries = match fs::read_dir(self.root.join(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Hidden names are in-flight temp files.
                if !name.starts_with('.') {
                    keys.push(format!("{prefix}{name}"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn put_file(&self, contents: &[u8]) -> StoreResult<FileId> {
        let id = Uuid::new_v4().to_string();
        let path = self.path_for(&keys::file(&id))?;
        write_atomic(&path, contents)?;
        Ok(id)
    }

    fn read_file(&self, id: &str) -> StoreResult<Box<dyn Read + Send>> {
        let key = keys::file(id);
        let path = self.path_for(&key)?;
        let file = fs::File::open(&path).map_err(|e| not_found_as(&key, e))?;
        Ok(Box::new(file))
    }

    fn delete_file(&self, id: &str) -> StoreResult<()> {
        self.delete(&keys::file(id))
    }
}
