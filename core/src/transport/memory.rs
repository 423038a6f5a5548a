//! In-process links between nodes, for tests and local simulations.
//!
//! A `MemoryConnection` delivers frames straight into the remote node's
//! inbound event queue. When that queue is full the frame is refused, the
//! same way a saturated radio link drops.

use super::abstraction::{Connection, ConnectionEvent, LinkId, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// One direction of an in-process link
pub struct MemoryConnection {
    /// Our id, as the remote side knows us
    local_id: String,
    remote: mpsc::Sender<ConnectionEvent>,
    open: AtomicBool,
}

impl MemoryConnection {
    pub fn new(local_id: impl Into<String>, remote: mpsc::Sender<ConnectionEvent>) -> Self {
        Self {
            local_id: local_id.into(),
            remote,
            open: AtomicBool::new(true),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.remote.is_closed()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let event = ConnectionEvent::Data {
            peer_id: self.local_id.clone(),
            frame,
        };
        match self.remote.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

/// Both halves of a link, so it can be torn down later
pub struct MemoryLink {
    a_id: String,
    b_id: String,
    link_id: LinkId,
    a_inbound: mpsc::Sender<ConnectionEvent>,
    b_inbound: mpsc::Sender<ConnectionEvent>,
    a_to_b: Arc<MemoryConnection>,
    b_to_a: Arc<MemoryConnection>,
}

impl MemoryLink {
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Close both directions and tell both nodes the link is gone
    pub async fn disconnect(self) -> Result<(), TransportError> {
        self.a_to_b.close();
        self.b_to_a.close();

        self.a_inbound
            .send(ConnectionEvent::Closed {
                peer_id: self.b_id,
                link_id: self.link_id,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        self.b_inbound
            .send(ConnectionEvent::Closed {
                peer_id: self.a_id,
                link_id: self.link_id,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(())
    }
}

/// Open a link between node `a` and node `b`, given each node's id and
/// inbound event queue. Both nodes receive a `ConnectionEvent::Opened`.
pub async fn connect_pair(
    a_id: &str,
    a_inbound: mpsc::Sender<ConnectionEvent>,
    b_id: &str,
    b_inbound: mpsc::Sender<ConnectionEvent>,
) -> Result<MemoryLink, TransportError> {
    let a_to_b = Arc::new(MemoryConnection::new(a_id, b_inbound.clone()));
    let b_to_a = Arc::new(MemoryConnection::new(b_id, a_inbound.clone()));
    let link_id = LinkId::next();

    a_inbound
        .send(ConnectionEvent::Opened {
            peer_id: b_id.to_string(),
            link_id,
            connection: a_to_b.clone(),
        })
        .await
        .map_err(|_| TransportError::Closed)?;
    b_inbound
        .send(ConnectionEvent::Opened {
            peer_id: a_id.to_string(),
            link_id,
            connection: b_to_a.clone(),
        })
        .await
        .map_err(|_| TransportError::Closed)?;

    Ok(MemoryLink {
        a_id: a_id.to_string(),
        b_id: b_id.to_string(),
        link_id,
        a_inbound,
        b_inbound,
        a_to_b,
        b_to_a,
    })
}
