/// MinBFT agreement core
///
/// Byzantine fault-tolerant state machine replication that tolerates F
/// faulty replicas out of N >= 2F+1, using a trusted monotonic counter
/// (USIG) in every replica:
/// - Two-phase Prepare/Commit ordering with F+1 commit quorums
/// - Periodic checkpoints and watermark-bounded request logs
/// - View changes that carry each replica's complete UI-certified log
///
/// Transport, authentication and the replicated application are
/// collaborators supplied through the traits in `api`.

pub mod api;
pub mod authen;
pub mod checkpoint;
pub mod config;
pub mod crypto;
pub mod messages;
pub mod network;
pub mod ordering;
pub mod pacemaker;
pub mod replica;
pub mod request_log;
pub mod sync;
pub mod ui;
pub mod view_change;

#[cfg(test)]
mod testing;

pub use api::{Authenticator, Configer, MessageStreamHandler, ReplicaConnector, RequestConsumer};
pub use config::ReplicaConfig;
pub use crypto::Hash;
pub use messages::{Message, Reply, Request};
pub use replica::{ReplicaCore, ReplicaEngine, ReplicaEvent, ReplicaHandle};
