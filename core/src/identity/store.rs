// Identity storage on the node's storage backend

use crate::store::backend::{StorageBackend, StorageError};
use std::sync::Arc;

const DEVICE_ID_KEY: &[u8] = b"device_id";

/// Persists the device identifier
pub struct IdentityStore {
    backend: Arc<dyn StorageBackend>,
}

impl IdentityStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Save the device id and flush
    pub fn save_device_id(&self, device_id: &str) -> Result<(), StorageError> {
        self.backend.put(DEVICE_ID_KEY, device_id.as_bytes())?;
        self.backend.flush()?;
        Ok(())
    }

    /// Load the stored device id, if any
    pub fn load_device_id(&self) -> Result<Option<String>, StorageError> {
        match self.backend.get(DEVICE_ID_KEY)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StorageError(format!("device id is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    /// Clear the stored device id
    pub fn clear(&self) -> Result<(), StorageError> {
        self.backend.remove(DEVICE_ID_KEY)?;
        self.backend.flush()?;
        Ok(())
    }
}
