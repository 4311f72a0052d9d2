// Replica-to-replica connections
//
// Opens one outbound message stream to every peer through the
// `ReplicaConnector` collaborator and keeps per-peer statistics.
// A peer whose stream fails is marked unreachable; the replica keeps
// running with the peers it still has.

pub mod memory;

use crate::api::{ConnectorError, MessageSink, ReplicaConnector};
use crate::messages::ReplicaId;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use memory::MemoryConnector;

/// Network error types
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Failed to send message to replica {0}")]
    SendError(ReplicaId),
    #[error("Peer not found: {0}")]
    PeerNotFound(ReplicaId),
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub replica_id: ReplicaId,

    /// Connection timestamp
    pub connected_at: Instant,

    /// Last successful send
    pub last_sent: Option<Instant>,

    pub messages_sent: u64,
}

/// Network health metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkHealth {
    pub connected_peers: usize,
    pub unreachable_peers: usize,
    pub total_messages_sent: u64,
    /// Fewer peers than a view-change quorum needs
    pub partition_detected: bool,
}

struct PeerLink {
    sink: MessageSink,
    info: PeerInfo,
}

pub struct PeerConnections {
    replica_id: ReplicaId,
    peers: BTreeMap<ReplicaId, PeerLink>,
    unreachable: BTreeSet<ReplicaId>,
    total_messages_sent: u64,
    /// Peers needed, besides this replica, to form a quorum
    min_peers: usize,
}

impl PeerConnections {
    pub fn new(replica_id: ReplicaId, min_peers: usize) -> Self {
        Self {
            replica_id,
            peers: BTreeMap::new(),
            unreachable: BTreeSet::new(),
            total_messages_sent: 0,
            min_peers,
        }
    }

    /// Connect to every peer in `peers`. Failures are recorded, not fatal;
    /// returns the replicas that could not be reached.
    pub async fn connect_all(
        &mut self,
        connector: &dyn ReplicaConnector,
        peers: impl IntoIterator<Item = ReplicaId>,
    ) -> Vec<ReplicaId> {
        let mut failed = Vec::new();
        for peer in peers {
            if peer == self.replica_id {
                continue;
            }
            if let Err(e) = self.connect(connector, peer).await {
                warn!("Replica {} cannot reach replica {}: {}", self.replica_id, peer, e);
                self.unreachable.insert(peer);
                failed.push(peer);
            }
        }
        failed
    }

    /// Open an outbound stream to `peer`
    pub async fn connect(&mut self, connector: &dyn ReplicaConnector, peer: ReplicaId) -> NetworkResult<()> {
        let handler = connector.replica_message_stream_handler(peer).await?;
        let (sink, stream) = mpsc::unbounded_channel();
        let mut answers = handler.handle_message_stream(stream).await?;
        // Peers talk back on their own outbound streams
        tokio::spawn(async move { while answers.recv().await.is_some() {} });

        self.peers.insert(
            peer,
            PeerLink {
                sink,
                info: PeerInfo {
                    replica_id: peer,
                    connected_at: Instant::now(),
                    last_sent: None,
                    messages_sent: 0,
                },
            },
        );
        self.unreachable.remove(&peer);
        info!("Replica {} connected to replica {}", self.replica_id, peer);
        Ok(())
    }

    /// Send to every connected peer. Returns the peers that just became
    /// unreachable.
    pub fn broadcast(&mut self, bytes: &[u8]) -> Vec<ReplicaId> {
        let targets: Vec<ReplicaId> = self.peers.keys().copied().collect();
        targets
            .into_iter()
            .filter(|peer| self.send_to(*peer, bytes.to_vec()).is_err())
            .collect()
    }

    pub fn send_to(&mut self, peer: ReplicaId, bytes: Vec<u8>) -> NetworkResult<()> {
        let delivered = match self.peers.get_mut(&peer) {
            None => return Err(NetworkError::PeerNotFound(peer)),
            Some(link) => {
                if link.sink.send(bytes).is_ok() {
                    link.info.messages_sent += 1;
                    link.info.last_sent = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        };
        if !delivered {
            warn!("Stream to replica {} closed; marking unreachable", peer);
            self.peers.remove(&peer);
            self.unreachable.insert(peer);
            return Err(NetworkError::SendError(peer));
        }
        self.total_messages_sent += 1;
        debug!("Sent message to replica {}", peer);
        Ok(())
    }

    pub fn is_reachable(&self, peer: ReplicaId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Get connected peers
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|link| link.info.clone()).collect()
    }

    /// Get network health metrics
    pub fn health(&self) -> NetworkHealth {
        NetworkHealth {
            connected_peers: self.peers.len(),
            unreachable_peers: self.unreachable.len(),
            total_messages_sent: self.total_messages_sent,
            partition_detected: self.peers.len() < self.min_peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MessageStream, MessageStreamHandler};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Records every payload it receives
    #[derive(Default)]
    struct Collector {
        received: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl MessageStreamHandler for Collector {
        async fn handle_message_stream(
            &self,
            mut incoming: MessageStream,
        ) -> Result<MessageStream, ConnectorError> {
            let received = self.received.clone();
            tokio::spawn(async move {
                while let Some(bytes) = incoming.recv().await {
                    received.lock().unwrap().push(bytes);
                }
            });
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_connect_and_broadcast() {
        let connector = MemoryConnector::new();
        let collector = Arc::new(Collector::default());
        let received = collector.received.clone();
        connector.register(1, collector).await;

        let mut net = PeerConnections::new(0, 1);
        let failed = net.connect_all(&connector, 0..3).await;
        assert_eq!(failed, vec![2]);

        assert!(net.broadcast(b"hello").is_empty());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(received.lock().unwrap().as_slice(), &[b"hello".to_vec()]);

        let health = net.health();
        assert_eq!(health.connected_peers, 1);
        assert_eq!(health.unreachable_peers, 1);
        assert_eq!(health.total_messages_sent, 1);
        assert!(!health.partition_detected);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let mut net = PeerConnections::new(0, 2);
        assert!(matches!(
            net.send_to(5, vec![1]),
            Err(NetworkError::PeerNotFound(5))
        ));
        assert!(net.health().partition_detected);
    }
}
