// Device identity: a stable identifier bound to this node

mod store;

pub use store::IdentityStore;

use crate::message::now_ms;
use crate::store::backend::{StorageBackend, StorageError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::sync::Arc;

/// The local node's device identifier.
///
/// Generated once and persisted; never regenerated while its storage
/// survives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    device_id: String,
}

impl DeviceIdentity {
    /// Generate a fresh identifier: `device_<unix ms>_<9 random chars>`
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();

        Self {
            device_id: format!("device_{}_{}", now_ms(), suffix),
        }
    }

    /// Load the stored identity, or create and persist one.
    ///
    /// `preferred` names the identifier to persist on first start; it is
    /// ignored once an identity exists.
    pub fn load_or_create(
        backend: Arc<dyn StorageBackend>,
        preferred: Option<&str>,
    ) -> Result<Self, StorageError> {
        let store = IdentityStore::new(backend);

        if let Some(device_id) = store.load_device_id()? {
            tracing::info!("Loaded existing identity {}", device_id);
            return Ok(Self { device_id });
        }

        let identity = match preferred {
            Some(device_id) if !device_id.is_empty() => Self {
                device_id: device_id.to_string(),
            },
            _ => Self::generate(),
        };
        tracing::info!("Created identity {}", identity.device_id);
        store.save_device_id(&identity.device_id)?;
        Ok(identity)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;

    #[test]
    fn test_generated_shape() {
        let identity = DeviceIdentity::generate();
        let parts: Vec<&str> = identity.device_id().split('_').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "device");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_identity_is_stable() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());

        let first = DeviceIdentity::load_or_create(backend.clone(), None).unwrap();
        let second = DeviceIdentity::load_or_create(backend, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_preferred_only_on_first_start() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());

        let first = DeviceIdentity::load_or_create(backend.clone(), Some("devA")).unwrap();
        assert_eq!(first.device_id(), "devA");

        let second = DeviceIdentity::load_or_create(backend, Some("devZ")).unwrap();
        assert_eq!(second.device_id(), "devA");
    }
}
