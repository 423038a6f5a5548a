// Store module: persistence backends and the outbox

pub mod backend;
pub mod outbox;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
pub use outbox::{Outbox, OutboxError, OutboxRecord, MAX_OUTBOX_RECORDS};
