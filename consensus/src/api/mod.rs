/// Collaborator contracts
/// 
/// The core talks to the outside world only through these traits:
/// - `Configer`: protocol parameters
/// - `ReplicaConnector` / `MessageStreamHandler`: message streams to peers
/// - `Authenticator`: tags for the replica, USIG and client roles
/// - `RequestConsumer`: the replicated application

use crate::messages::ReplicaId;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Stream of complete serialized `Message` envelopes
pub type MessageStream = mpsc::UnboundedReceiver<Vec<u8>>;

/// Sending half of a `MessageStream`
pub type MessageSink = mpsc::UnboundedSender<Vec<u8>>;

/// Protocol parameters, static for a running instance
pub trait Configer: Send + Sync {
    /// Number of replicas
    fn n(&self) -> u32;
    /// Number of Byzantine replicas tolerated
    fn f(&self) -> u32;
    fn checkpoint_period(&self) -> u32;
    /// Must exceed `checkpoint_period`
    fn logsize(&self) -> u32;
    /// Starts when a request is received, stops when it is executed
    fn timeout_request(&self) -> Duration;
    /// Starts when a ViewChange is sent, stops on a valid NewView
    fn timeout_view_change(&self) -> Duration;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Replica {0} is unknown to the connector")]
    UnknownReplica(ReplicaId),

    #[error("Replica {0} is unreachable")]
    Unreachable(ReplicaId),

    #[error("Message stream closed")]
    StreamClosed,
}

/// Obtains a local representation of a remote replica
#[async_trait]
pub trait ReplicaConnector: Send + Sync {
    async fn replica_message_stream_handler(
        &self,
        replica_id: ReplicaId,
    ) -> Result<Arc<dyn MessageStreamHandler>, ConnectorError>;
}

/// Handles one incoming stream and returns the stream produced in reply
#[async_trait]
pub trait MessageStreamHandler: Send + Sync {
    async fn handle_message_stream(
        &self,
        incoming: MessageStream,
    ) -> Result<MessageStream, ConnectorError>;
}

/// Credentials selected when generating or verifying a tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthenticationRole {
    /// Normal replica key
    Replica,
    /// Tamper-proof USIG certificate; the tag is an encoded `Ui`
    Usig,
    /// Client key
    Client,
}

impl fmt::Display for AuthenticationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthenticationRole::Replica => "replica",
            AuthenticationRole::Usig => "usig",
            AuthenticationRole::Client => "client",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenError {
    #[error("No {role} credentials for id {id}")]
    UnknownId { role: AuthenticationRole, id: u32 },

    #[error("Invalid {0} tag: {1}")]
    InvalidTag(AuthenticationRole, String),

    #[error("Role {0} cannot generate tags on this node")]
    Unsupported(AuthenticationRole),

    #[error("Tag generation failed: {0}")]
    Generation(String),
}

/// Identity management for replicas and clients. Called concurrently
/// from verification workers.
pub trait Authenticator: Send + Sync {
    fn verify_message_authen_tag(
        &self,
        role: AuthenticationRole,
        id: u32,
        msg: &[u8],
        tag: &[u8],
    ) -> Result<(), AuthenError>;

    fn generate_message_authen_tag(
        &self,
        role: AuthenticationRole,
        msg: &[u8],
    ) -> Result<Vec<u8>, AuthenError>;
}

/// The replicated state machine
pub trait RequestConsumer: Send {
    /// Execute an accepted operation and return its result
    fn deliver(&mut self, operation: &[u8]) -> Vec<u8>;

    /// Digest of the current application state
    fn state_digest(&self) -> Vec<u8>;
}
