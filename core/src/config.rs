// Node policy: routing limits and the outbox retry/retention horizons

use crate::message::DEFAULT_MAX_HOPS;
use crate::routing::DEFAULT_SEEN_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one `MeshNode`.
///
/// Every field has a default, so a partial JSON object deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier to persist on first start. Ignored once an identity exists.
    pub device_id: Option<String>,

    /// Hop budget stamped on originated envelopes
    pub max_hops: u32,

    /// Envelope lifetime in seconds
    pub ttl_secs: u64,

    /// Seen Set capacity
    pub seen_capacity: usize,

    /// Seconds between retry sweeps (and the minimum gap between
    /// re-broadcasts of one message)
    pub retry_interval_secs: u64,

    /// Unconfirmed messages older than this are marked failed
    pub give_up_after_secs: u64,

    /// Delivered-but-unread records are dropped after this long
    pub delivered_retention_secs: u64,

    /// Send READ as soon as a message is surfaced
    pub auto_read: bool,

    /// Bound of the inbound connection event queue
    pub inbound_queue: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            max_hops: DEFAULT_MAX_HOPS,
            ttl_secs: 60 * 60,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            retry_interval_secs: 30,
            give_up_after_secs: 60 * 60,
            delivered_retention_secs: 24 * 60 * 60,
            auto_read: true,
            inbound_queue: 1024,
        }
    }
}

impl NodeConfig {
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    pub fn give_up_after(&self) -> Duration {
        Duration::from_secs(self.give_up_after_secs)
    }

    pub fn delivered_retention(&self) -> Duration {
        Duration::from_secs(self.delivered_retention_secs)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.max_hops == 0 {
            return Err("max_hops must be at least 1".into());
        }
        if self.ttl_secs == 0 {
            return Err("ttl_secs must be at least 1".into());
        }
        if self.seen_capacity == 0 {
            return Err("seen_capacity must be at least 1".into());
        }
        if self.inbound_queue == 0 {
            return Err("inbound_queue must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.max_hops, 10);
        assert_eq!(config.ttl(), Duration::from_secs(3600));
        assert_eq!(config.give_up_after(), config.ttl());
        assert_eq!(config.retry_interval(), Duration::from_secs(30));
        assert!(config.auto_read);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: NodeConfig = serde_json::from_str(r#"{"max_hops": 4, "auto_read": false}"#).unwrap();
        assert_eq!(config.max_hops, 4);
        assert!(!config.auto_read);
        assert_eq!(config.ttl_secs, 3600);
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let config = NodeConfig {
            max_hops: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
