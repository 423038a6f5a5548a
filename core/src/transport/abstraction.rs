//! Transport abstraction for the mesh node
//!
//! A transport hands the node a `Connection` per open peer link and reports
//! link activity as `ConnectionEvent`s. The node never sees sockets,
//! framing or discovery.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Peer not connected: {0}")]
    NotConnected(String),

    #[error("Send queue full")]
    QueueFull,

    #[error("Send failed: {0}")]
    Send(String),
}

/// Identifies one link instance. Two links to the same peer (a redial, or
/// both sides dialing at once) never share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LinkId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// One open link to a directly connected peer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Hand one encoded envelope to the link.
    ///
    /// Must not wait for the remote side to drain: a link that cannot take
    /// the frame right now returns `QueueFull`. Frames handed to one link
    /// go out in order.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Events from the transport layer to the node
pub enum ConnectionEvent {
    /// A link to `peer_id` came up
    Opened {
        peer_id: String,
        link_id: LinkId,
        connection: Arc<dyn Connection>,
    },
    /// One frame arrived on the link to `peer_id`
    Data { peer_id: String, frame: Vec<u8> },
    /// The link `link_id` to `peer_id` went away
    Closed { peer_id: String, link_id: LinkId },
    /// The link to `peer_id` reported an error
    Error { peer_id: String, error: String },
}

impl ConnectionEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            ConnectionEvent::Opened { peer_id, .. }
            | ConnectionEvent::Data { peer_id, .. }
            | ConnectionEvent::Closed { peer_id, .. }
            | ConnectionEvent::Error { peer_id, .. } => peer_id,
        }
    }
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Opened {
                peer_id, link_id, ..
            } => write!(f, "Opened {{ peer_id: {}, {} }}", peer_id, link_id),
            ConnectionEvent::Data { peer_id, frame } => write!(
                f,
                "Data {{ peer_id: {}, frame_len: {} }}",
                peer_id,
                frame.len()
            ),
            ConnectionEvent::Closed { peer_id, link_id } => {
                write!(f, "Closed {{ peer_id: {}, {} }}", peer_id, link_id)
            }
            ConnectionEvent::Error { peer_id, error } => {
                write!(f, "Error {{ peer_id: {}, error: {} }}", peer_id, error)
            }
        }
    }
}
