//! Seen set: bounded, session-scoped dedup cache of envelope ids.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Default number of tracked ids
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Envelope id → first-seen time (unix ms).
///
/// Eviction is oldest-first once `capacity` is reached. `prune` also drops
/// entries older than the envelope TTL: an id that old can only belong to an
/// expired envelope, which the router rejects anyway.
#[derive(Debug)]
pub struct SeenSet {
    first_seen: HashMap<String, u64>,
    /// Insertion order (for O(1) FIFO eviction)
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            first_seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.first_seen.contains_key(id)
    }

    /// Record `id`. Returns `true` if it was not seen before.
    pub fn insert(&mut self, id: &str, now_ms: u64) -> bool {
        if self.first_seen.contains_key(id) {
            return false;
        }

        while self.first_seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.first_seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.first_seen.insert(id.to_string(), now_ms);
        self.order.push_back(id.to_string());
        true
    }

    /// Drop entries first seen more than `ttl` before `now_ms`.
    /// Returns how many were removed.
    pub fn prune(&mut self, ttl: Duration, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(ttl.as_millis() as u64);
        let mut removed = 0;

        // Insertion order is first-seen order, so expired ids sit at the front
        while let Some(oldest) = self.order.front() {
            match self.first_seen.get(oldest) {
                Some(&seen_at) if seen_at >= cutoff => break,
                _ => {
                    if let Some(id) = self.order.pop_front() {
                        if self.first_seen.remove(&id).is_some() {
                            removed += 1;
                        }
                    }
                }
            }
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_once() {
        let mut seen = SeenSet::new(10);
        assert!(seen.insert("a", 1));
        assert!(!seen.insert("a", 2));
        assert!(seen.contains("a"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let mut seen = SeenSet::new(3);
        seen.insert("a", 1);
        seen.insert("b", 2);
        seen.insert("c", 3);
        seen.insert("d", 4);

        assert_eq!(seen.len(), 3);
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("d"));
    }

    #[test]
    fn test_prune_by_ttl() {
        let mut seen = SeenSet::new(10);
        seen.insert("old", 1_000);
        seen.insert("mid", 5_000);
        seen.insert("new", 9_000);

        let removed = seen.prune(Duration::from_millis(4_000), 10_000);

        assert_eq!(removed, 2);
        assert!(!seen.contains("old"));
        assert!(!seen.contains("mid"));
        assert!(seen.contains("new"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut seen = SeenSet::new(0);
        assert!(seen.insert("a", 1));
        assert!(seen.insert("b", 2));
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("b"));
    }
}
