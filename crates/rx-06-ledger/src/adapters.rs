//! Key-value store adapters.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;

use crate::ports::{BatchOperation, KVStoreError, KeyValueStore};

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryKVStore {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    /// When set, the next `write_batch` fails (failure-injection hook).
    fail_next_batch: Mutex<bool>,
}

impl MemoryKVStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next batch fail with an I/O error.
    pub fn fail_next_batch(&self) {
        *self.fail_next_batch.lock() = true;
    }

    /// Number of keys stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKVStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn write_batch(&self, ops: Vec<BatchOperation>) -> Result<(), KVStoreError> {
        if std::mem::take(&mut *self.fail_next_batch.lock()) {
            return Err(KVStoreError::IOError {
                message: "injected batch failure".to_string(),
            });
        }
        let mut data = self.data.lock();
        for op in ops {
            match op {
                BatchOperation::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
        Ok(self
            .data
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// File-backed store: the whole map rewritten atomically on every batch.
///
/// Atomicity comes from the temp-file + rename: a reader (or a restarted
/// process) sees the pre-batch file or the post-batch file, never a torn
/// one. Suitable for the ledger's write rates; a real deployment can swap
/// in a native KV engine behind the same port.
pub struct FileKVStore {
    path: PathBuf,
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    _lock: std::fs::File,
}

impl FileKVStore {
    /// Open or create the store, taking its advisory lock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KVStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KVStoreError::IOError {
                message: e.to_string(),
            })?;
        }
        let lock = std::fs::File::create(path.with_extension("lock")).map_err(|e| {
            KVStoreError::IOError {
                message: e.to_string(),
            }
        })?;
        lock.try_lock_exclusive().map_err(|_| KVStoreError::IOError {
            message: "ledger store locked by another process".to_string(),
        })?;

        let data = match std::fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes).map_err(|e| KVStoreError::Corrupt {
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(KVStoreError::IOError {
                    message: e.to_string(),
                })
            }
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
            _lock: lock,
        })
    }

    fn persist(&self, data: &HashMap<Vec<u8>, Vec<u8>>) -> Result<(), KVStoreError> {
        let bytes = bincode::serialize(data).map_err(|e| KVStoreError::IOError {
            message: e.to_string(),
        })?;
        let temp = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp).map_err(|e| KVStoreError::IOError {
            message: e.to_string(),
        })?;
        file.write_all(&bytes).map_err(|e| KVStoreError::IOError {
            message: e.to_string(),
        })?;
        file.sync_all().map_err(|e| KVStoreError::IOError {
            message: e.to_string(),
        })?;
        std::fs::rename(&temp, &self.path).map_err(|e| KVStoreError::IOError {
            message: e.to_string(),
        })?;
        Ok(())
    }
}

impl KeyValueStore for FileKVStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn write_batch(&self, ops: Vec<BatchOperation>) -> Result<(), KVStoreError> {
        let mut data = self.data.lock();
        // Apply to a copy first: a persistence failure must leave the
        // in-memory view equal to the on-disk view.
        let mut updated = data.clone();
        for op in ops {
            match op {
                BatchOperation::Put { key, value } => {
                    updated.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    updated.remove(&key);
                }
            }
        }
        self.persist(&updated)?;
        *data = updated;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
        Ok(self
            .data
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &[u8], value: &[u8]) -> BatchOperation {
        BatchOperation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_memory_batch_and_scan() {
        let store = MemoryKVStore::new();
        store
            .write_batch(vec![put(b"fills/1", b"a"), put(b"fills/2", b"b"), put(b"txn/1", b"c")])
            .unwrap();
        assert_eq!(store.get(b"fills/1").unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.scan_prefix(b"fills/").unwrap().len(), 2);
    }

    #[test]
    fn test_injected_failure_applies_nothing() {
        let store = MemoryKVStore::new();
        store.fail_next_batch();
        assert!(store.write_batch(vec![put(b"k", b"v")]).is_err());
        assert!(store.get(b"k").unwrap().is_none());
        // Next batch succeeds again.
        store.write_batch(vec![put(b"k", b"v")]).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.kv");
        {
            let store = FileKVStore::open(&path).unwrap();
            store.write_batch(vec![put(b"fills/1", b"a")]).unwrap();
        }
        let store = FileKVStore::open(&path).unwrap();
        assert_eq!(store.get(b"fills/1").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn test_file_store_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.kv");
        let _store = FileKVStore::open(&path).unwrap();
        assert!(FileKVStore::open(&path).is_err());
    }

    #[test]
    fn test_corrupt_file_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.kv");
        std::fs::write(&path, b"\x00\x01garbage").unwrap();
        assert!(FileKVStore::open(&path).is_err());
    }
}
