//! Open peer links, keyed by peer device id

use super::abstraction::{Connection, LinkId, TransportError};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on one `Connection::send`. Sends only enqueue, so this only
/// trips on a transport that waits on its remote side.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct Link {
    id: LinkId,
    connection: Arc<dyn Connection>,
}

/// Outcome of sending one frame to several peers
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, TransportError)>,
}

impl FanOutReport {
    pub fn all_failed(&self) -> bool {
        self.delivered.is_empty()
    }
}

/// Shared table of open connections.
///
/// Cloning is cheap; all clones see the same table.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    connections: Arc<RwLock<HashMap<String, Link>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link. A newer link to the same peer replaces the old one.
    /// Returns `true` if the peer had no link before.
    pub fn insert(&self, peer_id: &str, link_id: LinkId, connection: Arc<dyn Connection>) -> bool {
        let link = Link {
            id: link_id,
            connection,
        };
        match self.connections.write().insert(peer_id.to_string(), link) {
            Some(replaced) => {
                debug!("{} to {} replaced by {}", replaced.id, peer_id, link_id);
                false
            }
            None => true,
        }
    }

    /// Drop the link to `peer_id`, but only if it is still `link_id`.
    /// A close reported by a link that was already replaced is ignored.
    pub fn remove(&self, peer_id: &str, link_id: LinkId) -> bool {
        let mut connections = self.connections.write();
        match connections.get(peer_id) {
            Some(link) if link.id == link_id => {
                connections.remove(peer_id);
                true
            }
            Some(link) => {
                debug!(
                    "Ignoring close of stale {} to {} (current {})",
                    link_id, peer_id, link.id
                );
                false
            }
            None => false,
        }
    }

    /// Id of the current link to `peer_id`
    pub fn link_id(&self, peer_id: &str) -> Option<LinkId> {
        self.connections.read().get(peer_id).map(|link| link.id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.connections.read().contains_key(peer_id)
    }

    /// Connected peer ids, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.connections.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub async fn send_to(&self, peer_id: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        let connection = self
            .connections
            .read()
            .get(peer_id)
            .map(|link| link.connection.clone())
            .ok_or_else(|| TransportError::NotConnected(peer_id.to_string()))?;
        send_bounded(peer_id, connection.as_ref(), frame).await
    }

    /// Send `frame` to every target concurrently. A failing or full link does
    /// not hold up the others.
    pub async fn fan_out(&self, targets: &[String], frame: &[u8]) -> FanOutReport {
        let links: Vec<(String, Option<Arc<dyn Connection>>)> = {
            let connections = self.connections.read();
            targets
                .iter()
                .map(|peer| {
                    let link = connections.get(peer).map(|link| link.connection.clone());
                    (peer.clone(), link)
                })
                .collect()
        };

        let sends = links.into_iter().map(|(peer, link)| async move {
            let result = match link {
                Some(connection) => send_bounded(&peer, connection.as_ref(), frame.to_vec()).await,
                None => Err(TransportError::NotConnected(peer.clone())),
            };
            (peer, result)
        });

        let mut report = FanOutReport::default();
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(peer),
                Err(e) => {
                    warn!("Send to {} failed: {}", peer, e);
                    report.failed.push((peer, e));
                }
            }
        }

        debug!(
            "Fan-out: {} delivered, {} failed",
            report.delivered.len(),
            report.failed.len()
        );
        report
    }
}

async fn send_bounded(
    peer_id: &str,
    connection: &dyn Connection,
    frame: Vec<u8>,
) -> Result<(), TransportError> {
    match tokio::time::timeout(SEND_TIMEOUT, connection.send(frame)).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Send to {} timed out", peer_id);
            Err(TransportError::QueueFull)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::abstraction::MockConnection;

    fn ok_link(expected_frame: Vec<u8>) -> Arc<dyn Connection> {
        let mut mock = MockConnection::new();
        mock.expect_send()
            .withf(move |frame| *frame == expected_frame)
            .times(1)
            .returning(|_| Ok(()));
        Arc::new(mock)
    }

    fn failing_link() -> Arc<dyn Connection> {
        let mut mock = MockConnection::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Err(TransportError::Send("link reset".into())));
        Arc::new(mock)
    }

    #[test]
    fn test_insert_remove_peers() {
        let table = ConnectionTable::new();
        let (a1, a2, b) = (LinkId::next(), LinkId::next(), LinkId::next());
        assert!(table.insert("devB", b, Arc::new(MockConnection::new())));
        assert!(table.insert("devA", a1, Arc::new(MockConnection::new())));
        assert!(!table.insert("devA", a2, Arc::new(MockConnection::new())));

        assert_eq!(table.peers(), vec!["devA".to_string(), "devB".to_string()]);
        assert_eq!(table.link_id("devA"), Some(a2));
        assert!(table.remove("devA", a2));
        assert!(!table.remove("devA", a2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_close_keeps_replacement() {
        let table = ConnectionTable::new();
        let (old, new) = (LinkId::next(), LinkId::next());
        table.insert("devB", old, Arc::new(MockConnection::new()));
        table.insert("devB", new, Arc::new(MockConnection::new()));

        assert!(!table.remove("devB", old));
        assert!(table.contains("devB"));
        assert_eq!(table.link_id("devB"), Some(new));
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let table = ConnectionTable::new();
        table.insert("devA", LinkId::next(), ok_link(b"frame".to_vec()));
        table.insert("devB", LinkId::next(), failing_link());
        table.insert("devC", LinkId::next(), ok_link(b"frame".to_vec()));

        let targets = vec!["devA".to_string(), "devB".to_string(), "devC".to_string()];
        let report = table.fan_out(&targets, b"frame").await;

        assert_eq!(report.delivered, vec!["devA".to_string(), "devC".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "devB");
        assert!(!report.all_failed());
    }

    /// Never completes a send
    struct StuckLink;

    #[async_trait::async_trait]
    impl Connection for StuckLink {
        async fn send(&self, _frame: Vec<u8>) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_link_times_out() {
        let table = ConnectionTable::new();
        table.insert("devA", LinkId::next(), ok_link(b"frame".to_vec()));
        table.insert("devS", LinkId::next(), Arc::new(StuckLink));

        let targets = vec!["devA".to_string(), "devS".to_string()];
        let report = table.fan_out(&targets, b"frame").await;

        assert_eq!(report.delivered, vec!["devA".to_string()]);
        assert_eq!(
            report.failed,
            vec![("devS".to_string(), TransportError::QueueFull)]
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let table = ConnectionTable::new();
        let result = table.send_to("ghost", vec![1]).await;
        assert_eq!(result, Err(TransportError::NotConnected("ghost".into())));
    }
}
