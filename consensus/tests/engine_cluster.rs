// End-to-end tests: replica engines talking over the in-memory connector

use minbft::api::{MessageStreamHandler, ReplicaConnector};
use minbft::authen::{AuthenDispatcher, ClusterKeys};
use minbft::network::MemoryConnector;
use minbft::replica::{ReplicaEngine, ReplicaEvent, ReplicaHandle};
use minbft::{Message, ReplicaConfig, Reply, Request, RequestConsumer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Key-value store driven by "key=value" operations
#[derive(Default)]
struct KvApp {
    entries: BTreeMap<String, String>,
}

impl RequestConsumer for KvApp {
    fn deliver(&mut self, operation: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(operation);
        match text.split_once('=') {
            Some((key, value)) => {
                let previous = self.entries.insert(key.to_string(), value.to_string());
                previous.unwrap_or_default().into_bytes()
            }
            None => self.entries.get(text.as_ref()).cloned().unwrap_or_default().into_bytes(),
        }
    }

    fn state_digest(&self) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        for (key, value) in &self.entries {
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
            hasher.update(value.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize().as_bytes().to_vec()
    }
}

struct TestCluster {
    config: ReplicaConfig,
    connector: MemoryConnector,
    handles: Vec<ReplicaHandle>,
    events: Vec<mpsc::UnboundedReceiver<ReplicaEvent>>,
    keys: ClusterKeys,
}

impl TestCluster {
    async fn start(config: ReplicaConfig) -> Self {
        testutil::init_test_logging();
        let keys = ClusterKeys::generate(config.n, 1);
        let connector = MemoryConnector::new();
        let mut engines = Vec::new();
        let mut handles = Vec::new();
        let mut events = Vec::new();

        for id in config.replicas() {
            let (engine, handle, event_rx) = ReplicaEngine::new(
                id,
                config.clone(),
                Arc::new(keys.replica_authenticator(id)),
                Box::new(KvApp::default()),
            )
            .unwrap();
            connector.register(id, Arc::new(handle.clone())).await;
            engines.push(engine);
            handles.push(handle);
            events.push(event_rx);
        }
        // Every handler is registered before anyone connects
        let shared: Arc<dyn ReplicaConnector> = Arc::new(connector.clone());
        for engine in engines {
            tokio::spawn(engine.run(shared.clone()));
        }

        Self {
            config,
            connector,
            handles,
            events,
            keys,
        }
    }

    fn client(&self) -> AuthenDispatcher {
        AuthenDispatcher::new(Arc::new(self.keys.client_authenticator(0)))
    }

    /// Send `request` to `replicas` and collect their replies
    async fn send(&self, request: &Request, replicas: &[u32]) -> mpsc::UnboundedReceiver<Reply> {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let bytes = Message::Request(request.clone()).to_bytes().unwrap();
        for &id in replicas {
            let handler = self.connector.replica_message_stream_handler(id).await.unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let mut replies = handler.handle_message_stream(rx).await.unwrap();
            tx.send(bytes.clone()).unwrap();

            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                // Keep the request stream open while waiting
                let _tx = tx;
                while let Some(bytes) = replies.recv().await {
                    if let Ok(Message::Reply(reply)) = Message::from_bytes(&bytes) {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                }
            });
        }
        reply_rx
    }

    /// Wait for F+1 verified, matching replies from distinct replicas
    async fn await_result(&self, replies: &mut mpsc::UnboundedReceiver<Reply>) -> Vec<u8> {
        let client = self.client();
        let needed = self.config.f as usize + 1;
        let mut votes: BTreeMap<Vec<u8>, Vec<u32>> = BTreeMap::new();
        loop {
            let reply = timeout(Duration::from_secs(10), replies.recv())
                .await
                .expect("timed out waiting for replies")
                .expect("reply streams closed");
            client.verify_reply(&reply).unwrap();
            let voters = votes.entry(reply.result.clone()).or_default();
            if !voters.contains(&reply.replica_id) {
                voters.push(reply.replica_id);
            }
            if voters.len() >= needed {
                return reply.result;
            }
        }
    }

    fn signed_request(&self, timestamp: u64, operation: &str) -> Request {
        let mut request = Request::new(0, timestamp, operation.as_bytes().to_vec());
        self.client().sign_request(&mut request).unwrap();
        request
    }

    async fn wait_for_event(
        &mut self,
        replica: usize,
        matches: impl Fn(&ReplicaEvent) -> bool,
    ) -> ReplicaEvent {
        loop {
            let event = timeout(Duration::from_secs(10), self.events[replica].recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    }
}

fn fast_config(n: u32, f: u32) -> ReplicaConfig {
    ReplicaConfig {
        n,
        f,
        checkpoint_period: 4,
        logsize: 8,
        timeout_request: Duration::from_millis(300),
        timeout_view_change: Duration::from_millis(600),
        max_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_engines_order_client_requests() {
    let mut cluster = TestCluster::start(fast_config(3, 1)).await;

    let mut results = Vec::new();
    for (ts, op) in ["a=1", "b=2", "a=3", "a"].iter().enumerate() {
        let request = cluster.signed_request(ts as u64 + 1, op);
        let mut replies = cluster.send(&request, &[0, 1, 2]).await;
        results.push(cluster.await_result(&mut replies).await);
    }
    assert_eq!(
        results,
        vec![b"".to_vec(), b"".to_vec(), b"1".to_vec(), b"3".to_vec()]
    );

    cluster
        .wait_for_event(1, |e| matches!(e, ReplicaEvent::RequestExecuted { seq: 4, .. }))
        .await;
    let status = cluster.handles[1].status().await.unwrap();
    assert_eq!(status.view, 0);
    assert_eq!(status.last_executed, 4);
    assert!(!status.halted);
    for handle in &cluster.handles {
        handle.shutdown();
    }
}

#[tokio::test]
async fn test_engines_checkpoint_past_the_window() {
    let mut cluster = TestCluster::start(fast_config(3, 1)).await;

    // Twice the log size forces several truncations
    for ts in 1..=16u64 {
        let request = cluster.signed_request(ts, &format!("k{}={}", ts, ts));
        let mut replies = cluster.send(&request, &[0, 1, 2]).await;
        cluster.await_result(&mut replies).await;
    }
    cluster
        .wait_for_event(2, |e| matches!(e, ReplicaEvent::CheckpointStable { seq } if *seq >= 12))
        .await;

    let status = cluster.handles[2].status().await.unwrap();
    assert!(status.stable_checkpoint >= 12);
    assert!(status.low_watermark >= 12);
}

#[tokio::test]
async fn test_engines_survive_primary_crash() {
    let mut cluster = TestCluster::start(fast_config(3, 1)).await;

    let request = cluster.signed_request(1, "x=1");
    let mut replies = cluster.send(&request, &[0, 1, 2]).await;
    cluster.await_result(&mut replies).await;

    cluster.handles[0].shutdown();
    cluster.connector.unregister(0).await;

    let request = cluster.signed_request(2, "x");
    let mut replies = cluster.send(&request, &[1, 2]).await;
    assert_eq!(cluster.await_result(&mut replies).await, b"1".to_vec());

    let event = cluster
        .wait_for_event(2, |e| matches!(e, ReplicaEvent::NewViewInstalled { .. }))
        .await;
    assert_eq!(event, ReplicaEvent::NewViewInstalled { view: 1, primary: 1 });
    assert_eq!(cluster.handles[1].status().await.unwrap().view, 1);
}

#[tokio::test]
async fn test_engine_rejects_invalid_config() {
    let keys = ClusterKeys::generate(3, 0);
    let config = ReplicaConfig {
        logsize: 4,
        checkpoint_period: 4,
        ..fast_config(3, 1)
    };
    let result = ReplicaEngine::new(
        0,
        config,
        Arc::new(keys.replica_authenticator(0)),
        Box::new(KvApp::default()),
    );
    assert!(result.is_err());
}
