// TCP peer links: newline-delimited JSON envelopes
//
// Every connection opens with one handshake line in each direction,
// `{"hello":"<device id>"}`, so each side learns who is on the other end.
// After that each line is one encoded envelope, capped at MAX_ENVELOPE_SIZE.
//
// When two nodes dial each other at the same time both sides keep the link
// dialed by the smaller device id and drop the other one.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use meshrelay_core::message::MAX_ENVELOPE_SIZE;
use meshrelay_core::{Connection, ConnectionEvent, LinkId, TransportError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    hello: String,
}

/// Outbound half of a TCP link; frames are written by a dedicated task
pub struct TcpConnection {
    outbound: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkEntry {
    link_id: LinkId,
    preferred: bool,
}

/// Listens for and dials peer links, feeding them to one node
#[derive(Clone)]
pub struct TcpTransport {
    local_id: String,
    inbound: mpsc::Sender<ConnectionEvent>,
    links: Arc<Mutex<HashMap<String, LinkEntry>>>,
}

impl TcpTransport {
    pub fn new(local_id: impl Into<String>, inbound: mpsc::Sender<ConnectionEvent>) -> Self {
        Self {
            local_id: local_id.into(),
            inbound,
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Accept peer links on `addr` until the process exits.
    /// Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let bound = listener.local_addr()?;
        tracing::info!("Listening on {}", bound);

        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.attach(stream, false).await {
                                tracing::warn!("Inbound link from {} failed: {:#}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                    }
                }
            }
        });

        Ok(bound)
    }

    /// Dial a peer and hand the link to the node. Returns the peer's device id.
    pub async fn dial(&self, address: &str) -> Result<String> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("Failed to connect to {}", address))?;
        self.attach(stream, true).await
    }

    /// Handshake, then spawn the reader and writer tasks for one link
    async fn attach(&self, stream: TcpStream, dialed: bool) -> Result<String> {
        stream.set_nodelay(true).ok();
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_ENVELOPE_SIZE));

        let hello = serde_json::to_string(&Hello {
            hello: self.local_id.clone(),
        })?;
        framed.send(hello).await?;

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .context("Handshake timed out")?
            .context("Peer closed before handshake")??;
        let peer: Hello = serde_json::from_str(&first).context("Invalid handshake")?;
        let peer_id = peer.hello;
        if peer_id.is_empty() || peer_id == self.local_id {
            anyhow::bail!("Rejected handshake from {:?}", peer_id);
        }

        let link_id = LinkId::next();
        let preferred = dialed == (self.local_id < peer_id);
        {
            let mut links = self.links.lock();
            if let Some(existing) = links.get(&peer_id) {
                if existing.preferred && !preferred {
                    tracing::debug!(
                        "Keeping {} to {}; dropping the duplicate link",
                        existing.link_id,
                        peer_id
                    );
                    return Ok(peer_id);
                }
            }
            links.insert(peer_id.clone(), LinkEntry { link_id, preferred });
        }

        let (mut sink, mut lines) = framed.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);

        // Writer: one frame per line. Closing the sink shuts down our half of
        // the socket once the node lets go of the link.
        let writer_peer = peer_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let line = match String::from_utf8(frame) {
                    Ok(line) => line,
                    Err(_) => {
                        tracing::debug!("Skipping non-UTF-8 frame for {}", writer_peer);
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    tracing::debug!("Write to {} failed: {}", writer_peer, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.inbound
            .send(ConnectionEvent::Opened {
                peer_id: peer_id.clone(),
                link_id,
                connection: Arc::new(TcpConnection { outbound }),
            })
            .await
            .map_err(|_| anyhow::anyhow!("Node is not accepting links"))?;

        // Reader: forward each line until the link drops
        let inbound = self.inbound.clone();
        let links = self.links.clone();
        let reader_peer = peer_id.clone();
        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        let event = ConnectionEvent::Data {
                            peer_id: reader_peer.clone(),
                            frame: line.into_bytes(),
                        };
                        if inbound.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        tracing::debug!("Oversized frame from {}", reader_peer);
                    }
                    Err(LinesCodecError::Io(e)) => {
                        let _ = inbound
                            .send(ConnectionEvent::Error {
                                peer_id: reader_peer.clone(),
                                error: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }

            {
                let mut links = links.lock();
                if links.get(&reader_peer).map(|entry| entry.link_id) == Some(link_id) {
                    links.remove(&reader_peer);
                }
            }
            let _ = inbound
                .send(ConnectionEvent::Closed {
                    peer_id: reader_peer,
                    link_id,
                })
                .await;
        });

        Ok(peer_id)
    }
}
