/// In-process connector
///
/// Routes message streams between replicas (and clients) living in the
/// same process over tokio channels. Used by tests and single-process
/// deployments.

use crate::api::{ConnectorError, MessageStreamHandler, ReplicaConnector};
use crate::messages::ReplicaId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone, Default)]
pub struct MemoryConnector {
    handlers: Arc<RwLock<HashMap<ReplicaId, Arc<dyn MessageStreamHandler>>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, replica_id: ReplicaId, handler: Arc<dyn MessageStreamHandler>) {
        debug!("Registering replica {} with the in-memory connector", replica_id);
        self.handlers.write().await.insert(replica_id, handler);
    }

    /// Stop routing new streams to `replica_id`
    pub async fn unregister(&self, replica_id: ReplicaId) {
        self.handlers.write().await.remove(&replica_id);
    }
}

#[async_trait]
impl ReplicaConnector for MemoryConnector {
    async fn replica_message_stream_handler(
        &self,
        replica_id: ReplicaId,
    ) -> Result<Arc<dyn MessageStreamHandler>, ConnectorError> {
        self.handlers
            .read()
            .await
            .get(&replica_id)
            .cloned()
            .ok_or(ConnectorError::UnknownReplica(replica_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MessageStream;
    use tokio::sync::mpsc;

    /// Echoes every payload back on the reply stream
    struct Echo;

    #[async_trait]
    impl MessageStreamHandler for Echo {
        async fn handle_message_stream(
            &self,
            mut incoming: MessageStream,
        ) -> Result<MessageStream, ConnectorError> {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(bytes) = incoming.recv().await {
                    if tx.send(bytes).is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let connector = MemoryConnector::new();
        connector.register(3, Arc::new(Echo)).await;

        let handler = connector.replica_message_stream_handler(3).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut replies = handler.handle_message_stream(rx).await.unwrap();
        tx.send(b"ping".to_vec()).unwrap();
        assert_eq!(replies.recv().await.unwrap(), b"ping".to_vec());
    }

    #[tokio::test]
    async fn test_unknown_replica() {
        let connector = MemoryConnector::new();
        assert!(matches!(
            connector.replica_message_stream_handler(9).await,
            Err(ConnectorError::UnknownReplica(9))
        ));

        connector.register(9, Arc::new(Echo)).await;
        connector.unregister(9).await;
        assert!(connector.replica_message_stream_handler(9).await.is_err());
    }
}
