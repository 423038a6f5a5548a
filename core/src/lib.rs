// meshrelay core: store-and-forward mesh messaging
//
// A node floods encrypted envelopes to its directly connected peers, relays
// what is not addressed to it, and tracks delivery of what it originated
// through ACK and READ control frames.

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod identity;
pub mod message;
pub mod routing;
pub mod store;
pub mod transport;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

pub use config::NodeConfig;
pub use crypto::{DecryptError, EncryptError, NetworkKey};
pub use delivery::{DeliveryStatus, DeliveryTracker, StatusChange};
pub use identity::DeviceIdentity;
pub use message::{
    decode_envelope, encode_envelope, now_ms, DecodeError, EncryptedPayload, Envelope,
    EnvelopeBody, EnvelopeKind,
};
pub use routing::{ControlKind, DropReason, RouteAction, Router, RouterStats};
pub use store::{
    MemoryStorage, Outbox, OutboxError, OutboxRecord, SledStorage, StorageBackend, StorageError,
};
pub use transport::{
    connect_pair, Connection, ConnectionEvent, ConnectionTable, FanOutReport, LinkId,
    TransportError,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("Cryptography error: {0}")]
    Crypto(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Identity error: {0}")]
    Identity(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Already running")]
    AlreadyRunning,
    #[error("Node stopped")]
    Stopped,
}

impl From<OutboxError> for MeshError {
    fn from(err: OutboxError) -> Self {
        MeshError::Persistence(err.to_string())
    }
}

impl From<StorageError> for MeshError {
    fn from(err: StorageError) -> Self {
        MeshError::Persistence(err.to_string())
    }
}

impl From<EncryptError> for MeshError {
    fn from(err: EncryptError) -> Self {
        MeshError::Crypto(err.to_string())
    }
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// What the application sees for an accepted DATA envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedContent {
    /// Decrypted UTF-8 text
    Text(String),
    /// Payload could not be decrypted with this node's passphrase
    Undecryptable,
}

impl ReceivedContent {
    pub const UNDECRYPTABLE_PLACEHOLDER: &'static str = "[Unable to decrypt message]";

    pub fn text(&self) -> Option<&str> {
        match self {
            ReceivedContent::Text(text) => Some(text),
            ReceivedContent::Undecryptable => None,
        }
    }
}

impl fmt::Display for ReceivedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceivedContent::Text(text) => f.write_str(text),
            ReceivedContent::Undecryptable => f.write_str(Self::UNDECRYPTABLE_PLACEHOLDER),
        }
    }
}

/// Result of one maintenance pass over the outbox
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending messages re-broadcast
    pub retried: usize,
    /// Pending messages given up on
    pub failed: usize,
    /// Records removed (read, or delivered past retention)
    pub removed: usize,
    /// Seen Set entries pruned
    pub seen_pruned: usize,
    /// Unread entries older than the TTL forgotten
    pub unread_pruned: usize,
}

// ============================================================================
// NODE DELEGATE TRAIT
// ============================================================================

/// Callback interface for the application layer
pub trait NodeDelegate: Send + Sync {
    /// A DATA envelope addressed to this node was accepted
    fn on_message_received(&self, from: String, envelope_id: String, content: ReceivedContent);
    /// An originated message changed delivery status
    fn on_status_changed(&self, message_id: String, status: DeliveryStatus);
    /// A link to a peer came up
    fn on_peer_connected(&self, _peer_id: String) {}
    /// A link to a peer went away
    fn on_peer_disconnected(&self, _peer_id: String) {}
}

// ============================================================================
// MESH NODE IMPLEMENTATION
// ============================================================================

/// An accepted message still waiting for `mark_read`
struct Unread {
    sender: String,
    accepted_at: u64,
}

/// Outbox and tracker change together, so they share one lock
struct Ledger {
    outbox: Outbox,
    tracker: DeliveryTracker,
}

#[derive(Clone)]
pub struct MeshNode {
    identity: Arc<DeviceIdentity>,
    config: Arc<NodeConfig>,
    key: Arc<NetworkKey>,
    /// Forwarding engine (owns the Seen Set)
    router: Arc<Mutex<Router>>,
    /// Originated messages and their delivery status
    ledger: Arc<Mutex<Ledger>>,
    /// Open peer links
    connections: ConnectionTable,
    /// Accepted messages awaiting a manual READ
    unread: Arc<Mutex<HashMap<String, Unread>>>,
    /// Platform delegate for callbacks
    delegate: Arc<RwLock<Option<Arc<dyn NodeDelegate>>>>,
    inbound_tx: mpsc::Sender<ConnectionEvent>,
    inbound_rx: Arc<Mutex<Option<mpsc::Receiver<ConnectionEvent>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MeshNode {
    /// Open a node, deriving the network key from `passphrase` on a
    /// blocking worker.
    pub async fn new(
        config: NodeConfig,
        passphrase: &str,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, MeshError> {
        if passphrase.is_empty() {
            return Err(MeshError::InvalidInput("passphrase is empty".into()));
        }

        let passphrase = passphrase.to_string();
        let key = tokio::task::spawn_blocking(move || NetworkKey::derive(&passphrase))
            .await
            .map_err(|e| MeshError::Crypto(format!("key derivation task failed: {}", e)))?;

        Self::with_key(config, key, backend)
    }

    /// Open a node with an already derived network key
    pub fn with_key(
        config: NodeConfig,
        key: NetworkKey,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, MeshError> {
        config.validate().map_err(MeshError::InvalidInput)?;

        let identity = DeviceIdentity::load_or_create(backend.clone(), config.device_id.as_deref())
            .map_err(|e| MeshError::Identity(e.to_string()))?;

        let outbox = Outbox::new(backend);
        let mut tracker = DeliveryTracker::new();
        let records = outbox.list_all()?;
        for record in &records {
            tracker.restore(record.id(), record.status);
        }
        if !records.is_empty() {
            info!("Restored {} outbox record(s)", records.len());
        }

        let router = Router::new(identity.device_id(), config.ttl(), config.seen_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            identity: Arc::new(identity),
            config: Arc::new(config),
            key: Arc::new(key),
            router: Arc::new(Mutex::new(router)),
            ledger: Arc::new(Mutex::new(Ledger { outbox, tracker })),
            connections: ConnectionTable::new(),
            unread: Arc::new(Mutex::new(HashMap::new())),
            delegate: Arc::new(RwLock::new(None)),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
            shutdown: Arc::new(shutdown),
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Drain the inbound queue and run the periodic sweep until
    /// `shutdown()` is called. Only one loop may run per node.
    pub async fn run(&self) -> Result<(), MeshError> {
        let mut rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(MeshError::AlreadyRunning)?;
        let mut stop = self.shutdown.subscribe();
        if *stop.borrow() {
            return Err(MeshError::Stopped);
        }

        let mut sweep = tokio::time::interval(self.config.retry_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        sweep.tick().await;

        info!("Mesh node {} running", self.identity);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep(now_ms()).await {
                        warn!("Sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Mesh node {} stopped", self.identity);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Sender side of the inbound event queue, for transports
    pub fn inbound(&self) -> mpsc::Sender<ConnectionEvent> {
        self.inbound_tx.clone()
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn NodeDelegate>>) {
        *self.delegate.write() = delegate;
    }

    // ------------------------------------------------------------------------
    // IDENTITY & STATE
    // ------------------------------------------------------------------------

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.connections.peers()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.lock().stats().clone()
    }

    /// Delivery status of an originated message still in the outbox
    pub fn status(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.ledger.lock().tracker.status(message_id)
    }

    /// Every outbox record, oldest first
    pub fn outbox(&self) -> Result<Vec<OutboxRecord>, MeshError> {
        Ok(self.ledger.lock().outbox.list_all()?)
    }

    /// Remove every `Failed` record. Returns how many were removed.
    pub fn dismiss_failed(&self) -> Result<usize, MeshError> {
        let mut ledger = self.ledger.lock();
        let mut removed = 0;
        for record in ledger.outbox.list_all()? {
            if record.status == DeliveryStatus::Failed && ledger.outbox.remove(record.id())? {
                ledger.tracker.forget(record.id());
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // MESSAGING
    // ------------------------------------------------------------------------

    /// Encrypt `plaintext` for `to`, persist it, and flood it to every
    /// connected peer. Returns the message id.
    ///
    /// With no peers connected the message stays queued and goes out when a
    /// link opens or on the next sweep.
    pub async fn send_message(&self, to: &str, plaintext: &str) -> Result<String, MeshError> {
        let to = to.trim();
        if to.is_empty() {
            return Err(MeshError::InvalidInput("recipient is empty".into()));
        }
        if to == self.device_id() {
            return Err(MeshError::InvalidInput("cannot send to self".into()));
        }
        if plaintext.is_empty() {
            return Err(MeshError::InvalidInput("message is empty".into()));
        }
        if plaintext.len() > message::MAX_PAYLOAD_SIZE {
            return Err(MeshError::InvalidInput(format!(
                "message exceeds {} bytes",
                message::MAX_PAYLOAD_SIZE
            )));
        }

        let now = now_ms();
        let payload = self.key.encrypt(plaintext.as_bytes())?;
        let envelope = Envelope::data(
            self.device_id().to_string(),
            to.to_string(),
            payload,
            self.config.max_hops,
            now,
        );
        let message_id = envelope.id.clone();

        {
            let mut ledger = self.ledger.lock();
            ledger.outbox.put(OutboxRecord::new(envelope.clone(), now))?;
            ledger.tracker.track(&message_id);
        }
        self.router.lock().remember(&message_id, now);

        debug!("Queued {} for {}", message_id, to);
        self.notify_status(&message_id, DeliveryStatus::Sent);

        let peers = self.connections.peers();
        if peers.is_empty() {
            debug!("No peers connected; {} waits in the outbox", message_id);
        } else {
            self.transmit(&envelope, &peers).await?;
        }

        Ok(message_id)
    }

    /// Send READ for an accepted message (when `auto_read` is off).
    /// Returns `false` if the id is unknown or already confirmed.
    pub async fn mark_read(&self, envelope_id: &str) -> Result<bool, MeshError> {
        let Some(unread) = self.unread.lock().remove(envelope_id) else {
            return Ok(false);
        };
        self.send_control(EnvelopeKind::Read, &unread.sender, envelope_id)
            .await;
        Ok(true)
    }

    /// Messages surfaced but not yet marked read
    pub fn unread(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.unread.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------------
    // INBOUND
    // ------------------------------------------------------------------------

    /// Apply one transport event. Decryption of accepted messages runs on a
    /// separate task so the caller is never held up by it.
    pub async fn handle_event(&self, event: ConnectionEvent) {
        trace!("Event: {}", event);
        match event {
            ConnectionEvent::Opened {
                peer_id,
                link_id,
                connection,
            } => {
                self.connections.insert(&peer_id, link_id, connection);
                info!("Peer connected: {} ({})", peer_id, link_id);
                if let Some(delegate) = self.delegate() {
                    delegate.on_peer_connected(peer_id.clone());
                }
                if let Err(e) = self.push_pending(&peer_id).await {
                    warn!("Failed to hand pending messages to {}: {}", peer_id, e);
                }
            }
            ConnectionEvent::Data { peer_id, frame } => {
                let action = match self.route_frame(&peer_id, &frame) {
                    Ok(action) => action,
                    Err(e) => {
                        debug!("Dropping frame from {}: {}", peer_id, e);
                        return;
                    }
                };
                match action {
                    RouteAction::Deliver(envelope) => {
                        let node = self.clone();
                        tokio::spawn(async move { node.complete_delivery(envelope).await });
                    }
                    other => self.perform(other).await,
                }
            }
            ConnectionEvent::Closed { peer_id, link_id } => {
                if self.connections.remove(&peer_id, link_id) {
                    info!("Peer disconnected: {}", peer_id);
                    if let Some(delegate) = self.delegate() {
                        delegate.on_peer_disconnected(peer_id);
                    }
                }
            }
            ConnectionEvent::Error { peer_id, error } => {
                warn!("Connection error from {}: {}", peer_id, error);
            }
        }
    }

    /// Route one encoded envelope that arrived on the link to `arrived_from`
    /// and carry out the decision before returning.
    pub async fn ingest(&self, arrived_from: &str, frame: &[u8]) -> Result<RouteAction, DecodeError> {
        let action = self.route_frame(arrived_from, frame)?;
        self.perform(action.clone()).await;
        Ok(action)
    }

    fn route_frame(&self, arrived_from: &str, frame: &[u8]) -> Result<RouteAction, DecodeError> {
        let envelope = decode_envelope(frame)?;
        let connected = self.connections.peers();
        Ok(self
            .router
            .lock()
            .route(envelope, Some(arrived_from), &connected, now_ms()))
    }

    async fn perform(&self, action: RouteAction) {
        match action {
            RouteAction::Deliver(envelope) => self.complete_delivery(envelope).await,
            RouteAction::Control {
                kind,
                correlation_id,
                from,
            } => {
                trace!("{:?} for {} from {}", kind, correlation_id, from);
                if let Err(e) = self.apply_control(kind, &correlation_id) {
                    warn!("Failed to record {:?} for {}: {}", kind, correlation_id, e);
                }
            }
            RouteAction::Forward { envelope, targets } => {
                let frame = encode_envelope(&envelope);
                self.connections.fan_out(&targets, &frame).await;
            }
            RouteAction::Dropped(_) => {}
        }
    }

    /// Decrypt an accepted DATA envelope, surface it, and confirm it
    async fn complete_delivery(&self, envelope: Envelope) {
        let Envelope { id, from, body, .. } = envelope;
        let EnvelopeBody::Data { payload } = body else {
            return;
        };

        let key = self.key.clone();
        let content = match tokio::task::spawn_blocking(move || key.decrypt(&payload)).await {
            Ok(Ok(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => ReceivedContent::Text(text),
                Err(_) => {
                    debug!("Message {} decrypted to non-UTF-8 bytes", id);
                    ReceivedContent::Undecryptable
                }
            },
            Ok(Err(e)) => {
                debug!("Cannot decrypt {} from {}: {}", id, from, e);
                ReceivedContent::Undecryptable
            }
            Err(e) => {
                warn!("Decryption task for {} failed: {}", id, e);
                ReceivedContent::Undecryptable
            }
        };
        let readable = matches!(content, ReceivedContent::Text(_));

        info!("Received {} from {}", id, from);
        if let Some(delegate) = self.delegate() {
            delegate.on_message_received(from.clone(), id.clone(), content);
        }

        self.send_control(EnvelopeKind::Ack, &from, &id).await;

        if !readable {
            return;
        }
        if self.config.auto_read {
            self.send_control(EnvelopeKind::Read, &from, &id).await;
        } else {
            let unread = Unread {
                sender: from,
                accepted_at: now_ms(),
            };
            self.unread.lock().insert(id, unread);
        }
    }

    /// Advance the delivery status of an originated message.
    ///
    /// The outbox is written first; the tracker only moves once the write
    /// succeeded, so a failed write leaves both at the old status.
    fn apply_control(&self, kind: ControlKind, message_id: &str) -> Result<(), MeshError> {
        let target = match kind {
            ControlKind::Ack => DeliveryStatus::Delivered,
            ControlKind::Read => DeliveryStatus::Read,
        };

        let change = {
            let mut ledger = self.ledger.lock();
            let advances = ledger
                .tracker
                .status(message_id)
                .is_some_and(|current| current.can_advance_to(target));
            if !advances {
                trace!("{:?} for {} changes nothing", kind, message_id);
                return Ok(());
            }

            if target == DeliveryStatus::Read {
                ledger.outbox.remove(message_id)?;
            } else {
                ledger.outbox.update_status(message_id, target, now_ms())?;
            }

            let change = match kind {
                ControlKind::Ack => ledger.tracker.apply_ack(message_id),
                ControlKind::Read => ledger.tracker.apply_read(message_id),
            };
            if target == DeliveryStatus::Read {
                ledger.tracker.forget(message_id);
            }
            match change {
                Some(change) => change,
                None => return Ok(()),
            }
        };

        debug!(
            "Message {}: {} → {}",
            change.message_id, change.previous, change.current
        );
        self.notify_status(&change.message_id, change.current);
        Ok(())
    }

    async fn send_control(&self, kind: EnvelopeKind, to: &str, correlation_id: &str) {
        let now = now_ms();
        let from = self.device_id().to_string();
        let envelope = match kind {
            EnvelopeKind::Ack => {
                Envelope::ack(from, to.to_string(), correlation_id.to_string(), self.config.max_hops, now)
            }
            EnvelopeKind::Read => {
                Envelope::read(from, to.to_string(), correlation_id.to_string(), self.config.max_hops, now)
            }
            EnvelopeKind::Data => return,
        };
        self.router.lock().remember(&envelope.id, now);

        let peers = self.connections.peers();
        if peers.is_empty() {
            debug!("No peers for {} of {}; dropped", kind, correlation_id);
            return;
        }

        let frame = encode_envelope(&envelope);
        let report = self.connections.fan_out(&peers, &frame).await;
        if report.all_failed() {
            warn!("{} for {} reached no peer", kind, correlation_id);
        }
    }

    // ------------------------------------------------------------------------
    // OUTBOX MAINTENANCE
    // ------------------------------------------------------------------------

    /// Flood an originated envelope and note the attempt
    async fn transmit(&self, envelope: &Envelope, peers: &[String]) -> Result<bool, MeshError> {
        let frame = encode_envelope(envelope);
        let report = self.connections.fan_out(peers, &frame).await;
        if report.all_failed() {
            return Ok(false);
        }
        self.ledger
            .lock()
            .outbox
            .record_attempt(&envelope.id, now_ms())?;
        Ok(true)
    }

    /// Hand every pending message to a newly connected peer
    async fn push_pending(&self, peer_id: &str) -> Result<usize, MeshError> {
        let pending = self.ledger.lock().outbox.pending()?;
        let peers = vec![peer_id.to_string()];
        let mut pushed = 0;
        for record in pending {
            if self.transmit(&record.envelope, &peers).await? {
                pushed += 1;
            }
        }
        if pushed > 0 {
            debug!("Handed {} pending message(s) to {}", pushed, peer_id);
        }
        Ok(pushed)
    }

    /// Retry, give up on, and expire outbox records as of `now_ms`, then
    /// prune the Seen Set and unread entries older than the TTL.
    pub async fn sweep(&self, now_ms: u64) -> Result<SweepReport, MeshError> {
        let give_up_after = self.config.give_up_after().as_millis() as u64;
        let retention = self.config.delivered_retention().as_millis() as u64;
        let retry_gap = self.config.retry_interval().as_millis() as u64;

        let mut report = SweepReport::default();
        let mut changes = Vec::new();
        let mut retry = Vec::new();

        {
            let mut ledger = self.ledger.lock();
            for record in ledger.outbox.list_all()? {
                let id = record.id().to_string();
                match record.status {
                    DeliveryStatus::Sent
                        if now_ms.saturating_sub(record.created_at()) > give_up_after =>
                    {
                        ledger
                            .outbox
                            .update_status(&id, DeliveryStatus::Failed, now_ms)?;
                        if let Some(change) = ledger.tracker.mark_failed(&id) {
                            changes.push(change);
                        }
                        report.failed += 1;
                    }
                    DeliveryStatus::Sent
                        if now_ms.saturating_sub(record.last_attempt_at) >= retry_gap =>
                    {
                        retry.push(record.envelope);
                    }
                    DeliveryStatus::Delivered
                        if now_ms.saturating_sub(record.status_changed_at) > retention =>
                    {
                        ledger.outbox.remove(&id)?;
                        ledger.tracker.forget(&id);
                        report.removed += 1;
                    }
                    DeliveryStatus::Read => {
                        ledger.outbox.remove(&id)?;
                        ledger.tracker.forget(&id);
                        report.removed += 1;
                    }
                    _ => {}
                }
            }
        }

        for change in &changes {
            warn!("Giving up on {}", change.message_id);
            self.notify_status(&change.message_id, change.current);
        }

        let peers = self.connections.peers();
        if !peers.is_empty() {
            for envelope in &retry {
                if self.transmit(envelope, &peers).await? {
                    report.retried += 1;
                }
            }
        }

        report.seen_pruned = self.router.lock().prune(now_ms);

        let ttl = self.config.ttl().as_millis() as u64;
        {
            let mut unread = self.unread.lock();
            let before = unread.len();
            unread.retain(|_, entry| now_ms.saturating_sub(entry.accepted_at) <= ttl);
            report.unread_pruned = before - unread.len();
        }

        if report != SweepReport::default() {
            debug!("Sweep: {:?}", report);
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // CALLBACKS
    // ------------------------------------------------------------------------

    fn delegate(&self) -> Option<Arc<dyn NodeDelegate>> {
        self.delegate.read().clone()
    }

    fn notify_status(&self, message_id: &str, status: DeliveryStatus) {
        if let Some(delegate) = self.delegate() {
            delegate.on_status_changed(message_id.to_string(), status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_key() -> NetworkKey {
        static KEY: OnceLock<NetworkKey> = OnceLock::new();
        KEY.get_or_init(|| NetworkKey::derive("unit-test-mesh")).clone()
    }

    fn node(device_id: &str) -> MeshNode {
        MeshNode::with_key(
            NodeConfig::default().with_device_id(device_id),
            test_key(),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(String, String, ReceivedContent)>>,
        statuses: Mutex<Vec<(String, DeliveryStatus)>>,
    }

    impl NodeDelegate for Recorder {
        fn on_message_received(&self, from: String, envelope_id: String, content: ReceivedContent) {
            self.received.lock().push((from, envelope_id, content));
        }

        fn on_status_changed(&self, message_id: String, status: DeliveryStatus) {
            self.statuses.lock().push((message_id, status));
        }
    }

    #[tokio::test]
    async fn test_send_without_peers_queues() {
        let node = node("devA");
        let id = node.send_message("devB", "hello").await.unwrap();

        assert_eq!(node.status(&id), Some(DeliveryStatus::Sent));
        let outbox = node.outbox().unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].attempts, 0);
        assert_eq!(outbox[0].recipient(), "devB");
    }

    #[tokio::test]
    async fn test_send_rejects_bad_input() {
        let node = node("devA");
        assert!(matches!(
            node.send_message("", "hi").await,
            Err(MeshError::InvalidInput(_))
        ));
        assert!(matches!(
            node.send_message("devA", "hi").await,
            Err(MeshError::InvalidInput(_))
        ));
        assert!(matches!(
            node.send_message("devB", "").await,
            Err(MeshError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_then_read_updates_outbox() {
        let node = node("devA");
        let recorder = Arc::new(Recorder::default());
        node.set_delegate(Some(recorder.clone()));

        let id = node.send_message("devB", "hello").await.unwrap();

        let ack = Envelope::ack("devB".into(), "devA".into(), id.clone(), 10, now_ms());
        let action = node.ingest("devB", &encode_envelope(&ack)).await.unwrap();
        assert!(matches!(action, RouteAction::Control { kind: ControlKind::Ack, .. }));
        assert_eq!(node.status(&id), Some(DeliveryStatus::Delivered));
        assert_eq!(node.outbox().unwrap()[0].status, DeliveryStatus::Delivered);

        let read = Envelope::read("devB".into(), "devA".into(), id.clone(), 10, now_ms());
        node.ingest("devB", &encode_envelope(&read)).await.unwrap();
        assert!(node.outbox().unwrap().is_empty());

        let statuses: Vec<DeliveryStatus> =
            recorder.statuses.lock().iter().map(|(_, s)| *s).collect();
        assert_eq!(
            statuses,
            vec![DeliveryStatus::Sent, DeliveryStatus::Delivered, DeliveryStatus::Read]
        );
    }

    #[tokio::test]
    async fn test_deliver_surfaces_text() {
        let recipient = node("devB");
        let recorder = Arc::new(Recorder::default());
        recipient.set_delegate(Some(recorder.clone()));

        let payload = test_key().encrypt(b"hi").unwrap();
        let envelope = Envelope::data("devA".into(), "devB".into(), payload, 10, now_ms());
        let action = recipient
            .ingest("devA", &encode_envelope(&envelope))
            .await
            .unwrap();

        assert!(matches!(action, RouteAction::Deliver(_)));
        let received = recorder.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "devA");
        assert_eq!(received[0].2, ReceivedContent::Text("hi".into()));
    }

    #[tokio::test]
    async fn test_manual_read() {
        let recipient = MeshNode::with_key(
            NodeConfig {
                auto_read: false,
                ..NodeConfig::default().with_device_id("devB")
            },
            test_key(),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap();

        let payload = test_key().encrypt(b"later").unwrap();
        let envelope = Envelope::data("devA".into(), "devB".into(), payload, 10, now_ms());
        recipient
            .ingest("devA", &encode_envelope(&envelope))
            .await
            .unwrap();

        assert_eq!(recipient.unread(), vec![envelope.id.clone()]);
        assert!(recipient.mark_read(&envelope.id).await.unwrap());
        assert!(!recipient.mark_read(&envelope.id).await.unwrap());
        assert!(recipient.unread().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_frame_is_rejected() {
        let node = node("devA");
        assert!(node.ingest("devB", b"not json").await.is_err());
        assert_eq!(node.router_stats(), RouterStats::default());
    }

    #[tokio::test]
    async fn test_sweep_gives_up_and_dismisses() {
        let node = node("devA");
        let id = node.send_message("devB", "anyone?").await.unwrap();

        let later = now_ms() + node.config().give_up_after().as_millis() as u64 + 1_000;
        let report = node.sweep(later).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(node.status(&id), Some(DeliveryStatus::Failed));
        assert_eq!(node.outbox().unwrap()[0].status, DeliveryStatus::Failed);

        // Failed records stay until dismissed
        assert_eq!(node.sweep(later + 1_000).await.unwrap().failed, 0);
        assert_eq!(node.dismiss_failed().unwrap(), 1);
        assert!(node.outbox().unwrap().is_empty());
        assert_eq!(node.status(&id), None);
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let node = node("devA");
        let runner = node.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::task::yield_now().await;

        // Wait for the loop to take the receiver
        for _ in 0..50 {
            if node.inbound_rx.lock().is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(node.run().await, Err(MeshError::AlreadyRunning));

        node.shutdown();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    /// Memory storage whose writes can be switched off
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    impl FlakyStorage {
        fn check(&self) -> Result<(), StorageError> {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError("disk full".into()));
            }
            Ok(())
        }
    }

    impl StorageBackend for FlakyStorage {
        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
            self.check()?;
            self.inner.put(key, value)
        }
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key)
        }
        fn remove(&self, key: &[u8]) -> Result<bool, StorageError> {
            self.check()?;
            self.inner.remove(key)
        }
        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
            self.inner.scan_prefix(prefix)
        }
        fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError> {
            self.inner.count_prefix(prefix)
        }
        fn flush(&self) -> Result<(), StorageError> {
            self.inner.flush()
        }
    }

    #[tokio::test]
    async fn test_failed_status_write_leaves_status_unchanged() {
        let storage = Arc::new(FlakyStorage::default());
        let node = MeshNode::with_key(
            NodeConfig::default().with_device_id("devA"),
            test_key(),
            storage.clone(),
        )
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        node.set_delegate(Some(recorder.clone()));

        let id = node.send_message("devB", "hello").await.unwrap();
        storage
            .fail_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let ack = Envelope::ack("devB".into(), "devA".into(), id.clone(), 10, now_ms());
        node.ingest("devB", &encode_envelope(&ack)).await.unwrap();
        let read = Envelope::read("devB".into(), "devA".into(), id.clone(), 10, now_ms());
        node.ingest("devB", &encode_envelope(&read)).await.unwrap();

        assert_eq!(node.status(&id), Some(DeliveryStatus::Sent));
        assert_eq!(node.outbox().unwrap()[0].status, DeliveryStatus::Sent);
        assert_eq!(recorder.statuses.lock().len(), 1);

        // A later confirmation still lands once storage recovers
        storage
            .fail_writes
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let ack = Envelope::ack("devB".into(), "devA".into(), id.clone(), 10, now_ms());
        node.ingest("devB", &encode_envelope(&ack)).await.unwrap();
        assert_eq!(node.status(&id), Some(DeliveryStatus::Delivered));
        assert_eq!(node.outbox().unwrap()[0].status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_sweep_forgets_stale_unread() {
        let recipient = MeshNode::with_key(
            NodeConfig {
                auto_read: false,
                ..NodeConfig::default().with_device_id("devB")
            },
            test_key(),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap();

        let payload = test_key().encrypt(b"unseen").unwrap();
        let envelope = Envelope::data("devA".into(), "devB".into(), payload, 10, now_ms());
        recipient
            .ingest("devA", &encode_envelope(&envelope))
            .await
            .unwrap();

        let report = recipient.sweep(now_ms()).await.unwrap();
        assert_eq!(report.unread_pruned, 0);
        assert_eq!(recipient.unread().len(), 1);

        let past_ttl = now_ms() + recipient.config().ttl().as_millis() as u64 + 1_000;
        let report = recipient.sweep(past_ttl).await.unwrap();
        assert_eq!(report.unread_pruned, 1);
        assert!(recipient.unread().is_empty());
        assert!(!recipient.mark_read(&envelope.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_close_does_not_drop_live_link() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Counting(AtomicUsize);

        #[async_trait::async_trait]
        impl Connection for Counting {
            async fn send(&self, _frame: Vec<u8>) -> Result<(), TransportError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let node = node("devA");
        let old = Arc::new(Counting::default());
        let live = Arc::new(Counting::default());
        let (old_id, live_id) = (LinkId::next(), LinkId::next());

        node.handle_event(ConnectionEvent::Opened {
            peer_id: "devB".into(),
            link_id: old_id,
            connection: old.clone(),
        })
        .await;
        node.handle_event(ConnectionEvent::Opened {
            peer_id: "devB".into(),
            link_id: live_id,
            connection: live.clone(),
        })
        .await;
        node.handle_event(ConnectionEvent::Closed {
            peer_id: "devB".into(),
            link_id: old_id,
        })
        .await;

        assert_eq!(node.connected_peers(), vec!["devB".to_string()]);
        node.send_message("devB", "hi").await.unwrap();
        assert_eq!(live.0.load(Ordering::SeqCst), 1);
        assert_eq!(old.0.load(Ordering::SeqCst), 0);

        node.handle_event(ConnectionEvent::Closed {
            peer_id: "devB".into(),
            link_id: live_id,
        })
        .await;
        assert!(node.connected_peers().is_empty());
    }

    #[test]
    fn test_undecryptable_display() {
        assert_eq!(
            ReceivedContent::Undecryptable.to_string(),
            "[Unable to decrypt message]"
        );
        assert_eq!(ReceivedContent::Text("hi".into()).text(), Some("hi"));
    }
}
