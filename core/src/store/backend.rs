// Storage abstraction for node persistence

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Storage error: {0}")]
pub struct StorageError(pub String);

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError(err.to_string())
    }
}

/// Key-value persistence used by the outbox and the device identity.
///
/// A write that returns `Ok` must be observable after a restart once
/// `flush` has returned `Ok`.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn remove(&self, key: &[u8]) -> Result<bool, StorageError>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

/// In-memory storage useful for testing and throwaway nodes
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.data.write().remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Disk-backed storage on a sled database
#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self.db.get(key)?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.db.remove(key)?.is_some())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError> {
        Ok(self.db.scan_prefix(prefix).count())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(backend: &dyn StorageBackend) {
        backend.put(b"outbox_a", b"1").unwrap();
        backend.put(b"outbox_b", b"2").unwrap();
        backend.put(b"device_id", b"devA").unwrap();

        assert_eq!(backend.get(b"outbox_a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.count_prefix(b"outbox_").unwrap(), 2);
        assert_eq!(backend.scan_prefix(b"outbox_").unwrap().len(), 2);

        assert!(backend.remove(b"outbox_a").unwrap());
        assert!(!backend.remove(b"outbox_a").unwrap());
        assert_eq!(backend.get(b"outbox_a").unwrap(), None);
        assert_eq!(backend.count_prefix(b"outbox_").unwrap(), 1);
        backend.flush().unwrap();
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_sled_storage() {
        let dir = tempdir().unwrap();
        let storage = SledStorage::open(dir.path().join("db")).unwrap();
        exercise(&storage);
    }

    #[test]
    fn test_sled_storage_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let storage = SledStorage::open(&path).unwrap();
            storage.put(b"device_id", b"devA").unwrap();
            storage.flush().unwrap();
        }

        let storage = SledStorage::open(&path).unwrap();
        assert_eq!(storage.get(b"device_id").unwrap(), Some(b"devA".to_vec()));
    }
}
