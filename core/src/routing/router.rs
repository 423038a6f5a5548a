//! Forwarding engine: the per-envelope routing state machine.
//!
//! Pure decision logic: `route()` takes an inbound envelope and returns a
//! `RouteAction` telling the caller what to do (deliver, apply a control
//! frame, forward, drop). No I/O, no transport dependency.
//!
//! Decision order for every envelope:
//! 1. Own echo (`from` is us) → drop
//! 2. Already in the Seen Set → drop; otherwise record it
//! 3. Expired (`created_at + ttl < now`) → drop, whatever the kind
//! 4. ACK/READ addressed to us → apply to delivery tracking
//! 5. DATA addressed to us → deliver, never forwarded
//! 6. Anything else → forward, unless the hop budget is spent or we are
//!    already on its path
//!
//! Control frames are deduplicated and relayed exactly like DATA.

use super::seen::SeenSet;
use crate::message::{Envelope, EnvelopeBody, EnvelopeKind};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

/// Which confirmation a control frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Ack,
    Read,
}

/// Why an envelope was dropped. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// We originated it
    OwnEcho,
    /// Already processed this session
    Duplicate,
    /// Older than the TTL
    Expired,
    /// `hop_count >= max_hops`
    HopLimit,
    /// We already relayed it
    Loop,
    /// Nobody left to forward to
    NoRoute,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DropReason::OwnEcho => "own echo",
            DropReason::Duplicate => "duplicate",
            DropReason::Expired => "expired",
            DropReason::HopLimit => "hop budget exhausted",
            DropReason::Loop => "already relayed",
            DropReason::NoRoute => "no other peers",
        };
        f.write_str(reason)
    }
}

/// What to do with an inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// DATA for us. Decrypt and surface, then acknowledge
    Deliver(Envelope),
    /// ACK/READ for us. Update delivery status of `correlation_id`
    Control {
        kind: ControlKind,
        correlation_id: String,
        from: String,
    },
    /// Not for us. Transmit `envelope` (already advanced one hop) to
    /// `targets`
    Forward {
        envelope: Envelope,
        targets: Vec<String>,
    },
    /// Silently dropped
    Dropped(DropReason),
}

/// Counters for status displays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub delivered: u64,
    pub control_applied: u64,
    pub forwarded: u64,
    pub dropped_duplicate: u64,
    pub dropped_other: u64,
}

/// The forwarding engine. Exclusively owns the Seen Set.
#[derive(Debug)]
pub struct Router {
    local_id: String,
    ttl: Duration,
    seen: SeenSet,
    stats: RouterStats,
}

impl Router {
    pub fn new(local_id: impl Into<String>, ttl: Duration, seen_capacity: usize) -> Self {
        Self {
            local_id: local_id.into(),
            ttl,
            seen: SeenSet::new(seen_capacity),
            stats: RouterStats::default(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Route one inbound envelope.
    ///
    /// `arrived_from` is the peer link it came in on (never sent back
    /// there); `connected` is the set of currently open links.
    pub fn route(
        &mut self,
        envelope: Envelope,
        arrived_from: Option<&str>,
        connected: &[String],
        now_ms: u64,
    ) -> RouteAction {
        let action = self.decide(envelope, arrived_from, connected, now_ms);
        self.count(&action);
        action
    }

    /// Mark an envelope we originated as seen, so a copy that loops back
    /// through a relay is dropped as a duplicate.
    pub fn remember(&mut self, envelope_id: &str, now_ms: u64) {
        self.seen.insert(envelope_id, now_ms);
    }

    /// Periodic cleanup of the Seen Set
    pub fn prune(&mut self, now_ms: u64) -> usize {
        self.seen.prune(self.ttl, now_ms)
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    fn decide(
        &mut self,
        envelope: Envelope,
        arrived_from: Option<&str>,
        connected: &[String],
        now_ms: u64,
    ) -> RouteAction {
        if envelope.from == self.local_id {
            trace!("Dropping own echo {}", envelope.id);
            return RouteAction::Dropped(DropReason::OwnEcho);
        }

        if !self.seen.insert(&envelope.id, now_ms) {
            trace!("Dropping duplicate {}", envelope.id);
            return RouteAction::Dropped(DropReason::Duplicate);
        }

        if envelope.is_expired(self.ttl, now_ms) {
            debug!("Dropping expired {} {}", envelope.kind(), envelope.id);
            return RouteAction::Dropped(DropReason::Expired);
        }

        if envelope.to == self.local_id {
            return match envelope.body {
                EnvelopeBody::Ack { correlation_id } => RouteAction::Control {
                    kind: ControlKind::Ack,
                    correlation_id,
                    from: envelope.from,
                },
                EnvelopeBody::Read { correlation_id } => RouteAction::Control {
                    kind: ControlKind::Read,
                    correlation_id,
                    from: envelope.from,
                },
                EnvelopeBody::Data { .. } => {
                    debug!("Accepting {} from {}", envelope.id, envelope.from);
                    RouteAction::Deliver(envelope)
                }
            };
        }

        self.forward(envelope, arrived_from, connected)
    }

    fn forward(
        &self,
        envelope: Envelope,
        arrived_from: Option<&str>,
        connected: &[String],
    ) -> RouteAction {
        if envelope.hop_budget_exhausted() {
            debug!(
                "Dropping {} {}: hop budget exhausted ({}/{})",
                envelope.kind(),
                envelope.id,
                envelope.hop_count,
                envelope.max_hops
            );
            return RouteAction::Dropped(DropReason::HopLimit);
        }

        if envelope.relayed_by(&self.local_id) {
            debug!("Dropping {}: already on its path", envelope.id);
            return RouteAction::Dropped(DropReason::Loop);
        }

        let targets: Vec<String> = connected
            .iter()
            .filter(|peer| Some(peer.as_str()) != arrived_from)
            .filter(|peer| **peer != envelope.from)
            .filter(|peer| !envelope.relayed_by(peer))
            .cloned()
            .collect();

        if targets.is_empty() {
            trace!("No onward peers for {}", envelope.id);
            return RouteAction::Dropped(DropReason::NoRoute);
        }

        let next = envelope.next_hop(&self.local_id);
        debug!(
            "Relaying {} {} to {} peer(s), hop {}/{}",
            next.kind(),
            next.id,
            targets.len(),
            next.hop_count,
            next.max_hops
        );

        RouteAction::Forward {
            envelope: next,
            targets,
        }
    }

    fn count(&mut self, action: &RouteAction) {
        match action {
            RouteAction::Deliver(_) => self.stats.delivered += 1,
            RouteAction::Control { .. } => self.stats.control_applied += 1,
            RouteAction::Forward { .. } => self.stats.forwarded += 1,
            RouteAction::Dropped(DropReason::Duplicate) => self.stats.dropped_duplicate += 1,
            RouteAction::Dropped(_) => self.stats.dropped_other += 1,
        }
    }
}

impl ControlKind {
    pub fn from_kind(kind: EnvelopeKind) -> Option<Self> {
        match kind {
            EnvelopeKind::Ack => Some(ControlKind::Ack),
            EnvelopeKind::Read => Some(ControlKind::Read),
            EnvelopeKind::Data => None,
        }
    }
}
