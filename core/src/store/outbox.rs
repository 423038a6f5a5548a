// Outbox: durable record of originated messages awaiting confirmation
//
// One record per DATA envelope this node sent. Records are written through
// the storage backend and flushed before a call returns, so a successful
// put or status update is still there after a restart.

use super::backend::{StorageBackend, StorageError};
use crate::delivery::DeliveryStatus;
use crate::message::Envelope;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Maximum records held at once
pub const MAX_OUTBOX_RECORDS: usize = 10_000;

const OUTBOX_PREFIX: &[u8] = b"outbox_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Outbox full ({0} messages)")]
    Full(usize),
}

/// An originated DATA envelope and its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    /// The envelope exactly as first sent (hop 0, empty path)
    pub envelope: Envelope,
    pub status: DeliveryStatus,
    /// Last time the envelope was handed to the transport (unix ms)
    pub last_attempt_at: u64,
    /// Transmissions so far, including the first
    pub attempts: u32,
    /// When `status` last changed (unix ms)
    pub status_changed_at: u64,
}

impl OutboxRecord {
    /// A new record in `Sent`, not yet transmitted
    pub fn new(envelope: Envelope, now_ms: u64) -> Self {
        Self {
            envelope,
            status: DeliveryStatus::Sent,
            last_attempt_at: 0,
            attempts: 0,
            status_changed_at: now_ms,
        }
    }

    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    pub fn recipient(&self) -> &str {
        &self.envelope.to
    }

    pub fn created_at(&self) -> u64 {
        self.envelope.created_at
    }
}

/// Persistent outbound message store
pub struct Outbox {
    backend: Arc<dyn StorageBackend>,
}

impl Outbox {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn key(message_id: &str) -> Vec<u8> {
        let mut key = OUTBOX_PREFIX.to_vec();
        key.extend_from_slice(message_id.as_bytes());
        key
    }

    fn write(&self, record: &OutboxRecord) -> Result<(), OutboxError> {
        let bytes =
            serde_json::to_vec(record).map_err(|e| OutboxError::Serialization(e.to_string()))?;
        self.backend.put(&Self::key(record.id()), &bytes)?;
        self.backend.flush()?;
        Ok(())
    }

    /// Store a new record. Returns `false` without touching storage if a
    /// record with the same id already exists.
    pub fn put(&self, record: OutboxRecord) -> Result<bool, OutboxError> {
        if self.backend.get(&Self::key(record.id()))?.is_some() {
            return Ok(false);
        }

        let total = self.backend.count_prefix(OUTBOX_PREFIX)?;
        if total >= MAX_OUTBOX_RECORDS {
            return Err(OutboxError::Full(MAX_OUTBOX_RECORDS));
        }

        self.write(&record)?;
        Ok(true)
    }

    pub fn get(&self, message_id: &str) -> Result<Option<OutboxRecord>, OutboxError> {
        match self.backend.get(&Self::key(message_id))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| OutboxError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Remove a record (after delivery, read, or dismissal of a failure)
    pub fn remove(&self, message_id: &str) -> Result<bool, OutboxError> {
        let removed = self.backend.remove(&Self::key(message_id))?;
        if removed {
            self.backend.flush()?;
        }
        Ok(removed)
    }

    /// Persist a new status. Returns the updated record, or `None` if the
    /// id is unknown.
    pub fn update_status(
        &self,
        message_id: &str,
        status: DeliveryStatus,
        now_ms: u64,
    ) -> Result<Option<OutboxRecord>, OutboxError> {
        let Some(mut record) = self.get(message_id)? else {
            return Ok(None);
        };

        record.status = status;
        record.status_changed_at = now_ms;
        self.write(&record)?;
        Ok(Some(record))
    }

    /// Note a transmission of the record's envelope
    pub fn record_attempt(&self, message_id: &str, now_ms: u64) -> Result<bool, OutboxError> {
        let Some(mut record) = self.get(message_id)? else {
            return Ok(false);
        };

        record.attempts = record.attempts.saturating_add(1);
        record.last_attempt_at = now_ms;
        self.write(&record)?;
        Ok(true)
    }

    /// Every record, oldest first. Undecodable entries are skipped.
    pub fn list_all(&self) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut records: Vec<OutboxRecord> = self
            .backend
            .scan_prefix(OUTBOX_PREFIX)?
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_slice(&value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        "Skipping corrupt outbox entry {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                    None
                }
            })
            .collect();

        records.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(records)
    }

    /// Records still waiting for an ACK or READ
    pub fn pending(&self) -> Result<Vec<OutboxRecord>, OutboxError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|record| record.status == DeliveryStatus::Sent)
            .collect())
    }

    pub fn len(&self) -> Result<usize, OutboxError> {
        Ok(self.backend.count_prefix(OUTBOX_PREFIX)?)
    }

    pub fn is_empty(&self) -> Result<bool, OutboxError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EncryptedPayload;
    use crate::store::backend::{MemoryStorage, SledStorage};
    use tempfile::tempdir;

    fn make_record(to: &str, created_at: u64) -> OutboxRecord {
        let envelope = Envelope::data(
            "devA".to_string(),
            to.to_string(),
            EncryptedPayload {
                ciphertext: vec![1, 2, 3],
                iv: vec![0u8; 12],
            },
            10,
            created_at,
        );
        OutboxRecord::new(envelope, created_at)
    }

    fn memory_outbox() -> Outbox {
        Outbox::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_put_and_list() {
        let outbox = memory_outbox();
        let newer = make_record("peer_a", 2_000);
        let older = make_record("peer_b", 1_000);

        assert!(outbox.put(newer.clone()).unwrap());
        assert!(outbox.put(older.clone()).unwrap());

        let all = outbox.list_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id(), older.id());
        assert_eq!(all[1].id(), newer.id());
        assert_eq!(outbox.len().unwrap(), 2);
    }

    #[test]
    fn test_put_is_at_most_once_per_id() {
        let outbox = memory_outbox();
        let record = make_record("peer_a", 1_000);

        assert!(outbox.put(record.clone()).unwrap());
        outbox.update_status(record.id(), DeliveryStatus::Delivered, 1_500).unwrap();

        // A second put with the same id must not reset the status
        assert!(!outbox.put(record.clone()).unwrap());
        let stored = outbox.get(record.id()).unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn test_remove() {
        let outbox = memory_outbox();
        let record = make_record("peer_a", 1_000);
        outbox.put(record.clone()).unwrap();

        assert!(outbox.remove(record.id()).unwrap());
        assert!(!outbox.remove(record.id()).unwrap()); // Already removed
        assert!(outbox.is_empty().unwrap());
    }

    #[test]
    fn test_update_status() {
        let outbox = memory_outbox();
        let record = make_record("peer_a", 1_000);
        outbox.put(record.clone()).unwrap();

        let updated = outbox
            .update_status(record.id(), DeliveryStatus::Read, 3_000)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Read);
        assert_eq!(updated.status_changed_at, 3_000);

        assert!(outbox
            .update_status("unknown", DeliveryStatus::Read, 3_000)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_record_attempt() {
        let outbox = memory_outbox();
        let record = make_record("peer_a", 1_000);
        outbox.put(record.clone()).unwrap();

        outbox.record_attempt(record.id(), 1_100).unwrap();
        outbox.record_attempt(record.id(), 1_200).unwrap();

        let stored = outbox.get(record.id()).unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_attempt_at, 1_200);
    }

    #[test]
    fn test_pending_excludes_confirmed() {
        let outbox = memory_outbox();
        let a = make_record("peer_a", 1_000);
        let b = make_record("peer_b", 1_001);
        outbox.put(a.clone()).unwrap();
        outbox.put(b.clone()).unwrap();
        outbox.update_status(b.id(), DeliveryStatus::Delivered, 1_500).unwrap();

        let pending = outbox.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), a.id());
    }

    #[test]
    fn test_corrupt_entry_is_skipped() {
        let backend = Arc::new(MemoryStorage::new());
        let outbox = Outbox::new(backend.clone());
        outbox.put(make_record("peer_a", 1_000)).unwrap();
        backend.put(b"outbox_garbage", b"not json").unwrap();

        assert_eq!(outbox.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_persistent_outbox_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox_store");
        let record = make_record("peer_a", 1_000);

        // First instance: store and confirm
        {
            let outbox = Outbox::new(Arc::new(SledStorage::open(&path).unwrap()));
            outbox.put(record.clone()).unwrap();
            outbox
                .update_status(record.id(), DeliveryStatus::Delivered, 2_000)
                .unwrap();
        }

        // Second instance: the record and its status should still be there
        {
            let outbox = Outbox::new(Arc::new(SledStorage::open(&path).unwrap()));
            let all = outbox.list_all().unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].id(), record.id());
            assert_eq!(all[0].status, DeliveryStatus::Delivered);
            assert_eq!(all[0].envelope.payload(), record.envelope.payload());
        }
    }
}
