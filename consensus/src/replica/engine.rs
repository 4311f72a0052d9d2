/// Replica Engine - async driver for the replica core
///
/// The ReplicaEngine ties together:
/// - ReplicaCore (all protocol state, mutated from one task only)
/// - PeerConnections (outbound streams to every other replica)
/// - Verification workers (one per incoming stream)
/// - Request and view-change timers
///
/// Incoming streams are served by `ReplicaHandle`, which peers and clients
/// reach through a `ReplicaConnector`.

use super::{Output, ReplicaCore, ReplicaEvent, ReplicaStatus, TimerCommand, TimerKind, Timeout};
use super::{VerifiedMessage, Verifier};
use crate::api::{
    Authenticator, ConnectorError, MessageSink, MessageStream, MessageStreamHandler,
    ReplicaConnector, RequestConsumer,
};
use crate::config::{ConfigError, ReplicaConfig};
use crate::messages::{ClientId, Message, ReplicaId, Reply, SeqNum, View};
use crate::network::PeerConnections;
use crate::sync::SyncError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, Instrument};

/// Replica engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("State transfer rejected: {0}")]
    Sync(#[from] SyncError),

    #[error("Replica engine stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, EngineError>;

enum Command {
    Deliver {
        message: VerifiedMessage,
        /// Stream the sender listens on, for client requests
        reply_to: Option<MessageSink>,
    },
    StateTransferred {
        seq: SeqNum,
        done: oneshot::Sender<Result<()>>,
    },
    Status(oneshot::Sender<ReplicaStatus>),
    Shutdown,
}

/// Cloneable entry point to a running engine
#[derive(Clone)]
pub struct ReplicaHandle {
    replica_id: ReplicaId,
    verifier: Verifier,
    mailbox: mpsc::UnboundedSender<Command>,
}

impl ReplicaHandle {
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub async fn status(&self) -> Result<ReplicaStatus> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::Status(tx))
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Report that the application state was replaced up to `seq`
    pub async fn complete_state_transfer(&self, seq: SeqNum) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.mailbox
            .send(Command::StateTransferred { seq, done })
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    pub fn shutdown(&self) {
        let _ = self.mailbox.send(Command::Shutdown);
    }
}

#[async_trait]
impl MessageStreamHandler for ReplicaHandle {
    async fn handle_message_stream(
        &self,
        mut incoming: MessageStream,
    ) -> std::result::Result<MessageStream, ConnectorError> {
        let (replies, reply_stream) = mpsc::unbounded_channel();
        let verifier = self.verifier.clone();
        let mailbox = self.mailbox.clone();
        let replica_id = self.replica_id;

        tokio::spawn(async move {
            while let Some(bytes) = incoming.recv().await {
                let message = match verifier.decode_and_verify(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Replica {} dropped a message: {}", replica_id, e);
                        continue;
                    }
                };
                let reply_to = matches!(message.message(), Message::Request(_))
                    .then(|| replies.clone());
                if mailbox.send(Command::Deliver { message, reply_to }).is_err() {
                    break;
                }
            }
        });
        Ok(reply_stream)
    }
}

/// Reply streams per client. A request may reach the replica on several
/// streams (the client's own, or a peer replaying it), so every live one
/// gets the reply.
#[derive(Default)]
struct ReplyRoutes {
    sinks: HashMap<ClientId, Vec<MessageSink>>,
}

impl ReplyRoutes {
    fn register(&mut self, client_id: ClientId, sink: MessageSink) {
        let sinks = self.sinks.entry(client_id).or_default();
        sinks.retain(|known| !known.is_closed());
        if !sinks.iter().any(|known| known.same_channel(&sink)) {
            sinks.push(sink);
        }
    }

    /// Send `bytes` on every live stream of `client_id`. Returns how many
    /// streams took it.
    fn send(&mut self, client_id: ClientId, bytes: &[u8]) -> usize {
        let Some(sinks) = self.sinks.get_mut(&client_id) else {
            return 0;
        };
        sinks.retain(|sink| sink.send(bytes.to_vec()).is_ok());
        let delivered = sinks.len();
        if delivered == 0 {
            self.sinks.remove(&client_id);
        }
        delivered
    }
}

/// Deadlines of the armed timers
#[derive(Debug, Default)]
struct Timers {
    request: Option<Instant>,
    view_change: Option<(Instant, View)>,
}

impl Timers {
    fn apply(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Start { timeout, after } => {
                let deadline = Instant::now() + after;
                match timeout {
                    Timeout::Request => self.request = Some(deadline),
                    Timeout::ViewChange(view) => self.view_change = Some((deadline, view)),
                }
            }
            TimerCommand::Stop(kind) => self.clear(kind),
        }
    }

    fn clear(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Request => self.request = None,
            TimerKind::ViewChange => self.view_change = None,
        }
    }

    /// Earliest armed deadline
    fn next(&self) -> Option<(Instant, Timeout)> {
        let request = self.request.map(|deadline| (deadline, Timeout::Request));
        let view_change = self
            .view_change
            .map(|(deadline, view)| (deadline, Timeout::ViewChange(view)));
        match (request, view_change) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        }
    }
}

async fn expiry(timer: Option<(Instant, Timeout)>) -> Timeout {
    match timer {
        Some((deadline, timeout)) => {
            sleep_until(deadline).await;
            timeout
        }
        None => std::future::pending().await,
    }
}

/// Main replica engine
pub struct ReplicaEngine {
    core: ReplicaCore,
    peers: PeerConnections,
    mailbox: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ReplicaEvent>,
    clients: ReplyRoutes,
    timers: Timers,
}

impl ReplicaEngine {
    /// Create an engine, the handle that feeds it and its event stream
    pub fn new(
        replica_id: ReplicaId,
        config: ReplicaConfig,
        authenticator: Arc<dyn Authenticator>,
        consumer: Box<dyn RequestConsumer>,
    ) -> Result<(Self, ReplicaHandle, mpsc::UnboundedReceiver<ReplicaEvent>)> {
        let min_peers = config.view_change_quorum().saturating_sub(1);
        let core = ReplicaCore::new(replica_id, config, authenticator, consumer)?;
        let (mailbox_tx, mailbox) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let handle = ReplicaHandle {
            replica_id,
            verifier: core.verifier(),
            mailbox: mailbox_tx,
        };
        let engine = Self {
            core,
            peers: PeerConnections::new(replica_id, min_peers),
            mailbox,
            events,
            clients: ReplyRoutes::default(),
            timers: Timers::default(),
        };
        Ok((engine, handle, events_rx))
    }

    /// Connect to the peers and process input until shut down
    pub async fn run(self, connector: Arc<dyn ReplicaConnector>) -> Result<()> {
        let span = info_span!("replica", id = self.core.id());
        self.serve(connector).instrument(span).await
    }

    async fn serve(mut self, connector: Arc<dyn ReplicaConnector>) -> Result<()> {
        let replicas: Vec<ReplicaId> = self.core.config().replicas().collect();
        for replica_id in self.peers.connect_all(connector.as_ref(), replicas).await {
            self.publish(ReplicaEvent::PeerUnreachable { replica_id });
        }
        info!("Replica {} running", self.core.id());

        loop {
            let next_timer = self.timers.next();
            tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(Command::Deliver { message, reply_to }) => {
                        if let (Some(sink), Message::Request(request)) = (reply_to, message.message()) {
                            self.clients.register(request.client_id, sink);
                        }
                        let out = self.core.handle_message(message);
                        self.dispatch(out);
                    }
                    Some(Command::StateTransferred { seq, done }) => {
                        let result = match self.core.complete_state_transfer(seq) {
                            Ok(out) => {
                                self.dispatch(out);
                                Ok(())
                            }
                            Err(e) => Err(EngineError::from(e)),
                        };
                        let _ = done.send(result);
                    }
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.core.status());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                timeout = expiry(next_timer) => {
                    self.timers.clear(timeout.kind());
                    let out = self.core.handle_timeout(timeout);
                    self.dispatch(out);
                }
            }
        }
        info!("Replica {} stopped", self.core.id());
        Ok(())
    }

    fn dispatch(&mut self, out: Output) {
        for message in out.broadcasts {
            match message.to_bytes() {
                Ok(bytes) => {
                    for replica_id in self.peers.broadcast(&bytes) {
                        self.publish(ReplicaEvent::PeerUnreachable { replica_id });
                    }
                }
                Err(e) => error!("Cannot encode {}: {}", message.message_type(), e),
            }
        }
        for reply in out.replies {
            self.send_reply(reply);
        }
        for command in out.timers {
            self.timers.apply(command);
        }
        for event in out.events {
            self.publish(event);
        }
    }

    fn send_reply(&mut self, reply: Reply) {
        let client_id = reply.client_id;
        let bytes = match Message::Reply(reply).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Cannot encode reply: {}", e);
                return;
            }
        };
        if self.clients.send(client_id, &bytes) == 0 {
            debug!("No open stream for client {}", client_id);
        }
    }

    fn publish(&self, event: ReplicaEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_timers_pick_earliest() {
        let mut timers = Timers::default();
        assert!(timers.next().is_none());

        timers.apply(TimerCommand::Start {
            timeout: Timeout::ViewChange(3),
            after: Duration::from_secs(10),
        });
        timers.apply(TimerCommand::Start {
            timeout: Timeout::Request,
            after: Duration::from_secs(1),
        });
        assert_eq!(timers.next().map(|(_, t)| t), Some(Timeout::Request));

        timers.apply(TimerCommand::Stop(TimerKind::Request));
        assert_eq!(timers.next().map(|(_, t)| t), Some(Timeout::ViewChange(3)));

        // Re-arming replaces the previous deadline
        timers.apply(TimerCommand::Start {
            timeout: Timeout::ViewChange(4),
            after: Duration::from_secs(1),
        });
        assert_eq!(timers.next().map(|(_, t)| t), Some(Timeout::ViewChange(4)));
    }

    #[test]
    fn test_reply_reaches_every_stream_of_the_client() {
        let mut routes = ReplyRoutes::default();
        let (client, mut client_rx) = mpsc::unbounded_channel();
        let (replayer, mut replayer_rx) = mpsc::unbounded_channel();

        routes.register(7, client.clone());
        // A replayed request on another stream does not take over
        routes.register(7, replayer);
        routes.register(7, client);
        assert_eq!(routes.send(7, b"reply"), 2);
        assert_eq!(client_rx.try_recv().unwrap(), b"reply".to_vec());
        assert_eq!(replayer_rx.try_recv().unwrap(), b"reply".to_vec());
        assert!(client_rx.try_recv().is_err());

        drop(replayer_rx);
        assert_eq!(routes.send(7, b"again"), 1);
        assert_eq!(client_rx.try_recv().unwrap(), b"again".to_vec());

        drop(client_rx);
        assert_eq!(routes.send(7, b"gone"), 0);
        assert_eq!(routes.send(8, b"unknown"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_waits_for_deadline() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let fired = expiry(Some((deadline, Timeout::Request))).await;
        assert_eq!(fired, Timeout::Request);
        assert!(Instant::now() >= deadline);
    }
}
