//! Delivery status tracking for originated messages.
//!
//! Pipeline: `Sent → Delivered → Read`, or `Sent → Failed` on give-up.
//! Status only moves forward. The tracker is pure logic: the node feeds it
//! ACK/READ frames and sweep decisions, and publishes the transitions it
//! returns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Delivery status of an originated message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Message left this device
    Sent,
    /// Recipient acknowledged receipt
    Delivered,
    /// Recipient presented the message to the user
    Read,
    /// No confirmation before the give-up horizon
    Failed,
}

impl DeliveryStatus {
    /// Whether `self -> next` is an allowed forward transition
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Sent, Delivered) | (Sent, Read) | (Sent, Failed) | (Delivered, Read)
        )
    }

    /// No further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Read | DeliveryStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status transition event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub message_id: String,
    pub previous: DeliveryStatus,
    pub current: DeliveryStatus,
}

/// Maps originated message ids to their displayed status.
///
/// Unknown ids are ignored: flooding routinely brings control frames for
/// messages this node never sent.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    statuses: HashMap<String, DeliveryStatus>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly sent message
    pub fn track(&mut self, message_id: &str) {
        self.statuses
            .insert(message_id.to_string(), DeliveryStatus::Sent);
    }

    /// Rebuild an entry from persisted state
    pub fn restore(&mut self, message_id: &str, status: DeliveryStatus) {
        self.statuses.insert(message_id.to_string(), status);
    }

    /// ACK received: `Sent → Delivered`. Repeated ACKs are no-ops.
    pub fn apply_ack(&mut self, message_id: &str) -> Option<StatusChange> {
        self.advance(message_id, DeliveryStatus::Delivered)
    }

    /// READ received: `Delivered → Read`, or `Sent → Read` as an implicit
    /// delivery.
    pub fn apply_read(&mut self, message_id: &str) -> Option<StatusChange> {
        self.advance(message_id, DeliveryStatus::Read)
    }

    /// Give-up horizon passed without confirmation
    pub fn mark_failed(&mut self, message_id: &str) -> Option<StatusChange> {
        self.advance(message_id, DeliveryStatus::Failed)
    }

    pub fn status(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.statuses.get(message_id).copied()
    }

    /// Stop tracking (after the outbox record is removed)
    pub fn forget(&mut self, message_id: &str) -> bool {
        self.statuses.remove(message_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    fn advance(&mut self, message_id: &str, next: DeliveryStatus) -> Option<StatusChange> {
        let entry = self.statuses.get_mut(message_id)?;
        if !entry.can_advance_to(next) {
            return None;
        }

        let previous = *entry;
        *entry = next;

        Some(StatusChange {
            message_id: message_id.to_string(),
            previous,
            current: next,
        })
    }
}
