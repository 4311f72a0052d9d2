/// Replica configuration
/// 
/// `ReplicaConfig` is the in-crate snapshot of the protocol parameters.
/// Quorum sizes are derived here and nowhere else.

use crate::api::Configer;
use crate::messages::{ReplicaId, View};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Need at least one replica")]
    NoReplicas,

    #[error("n = {n} cannot tolerate f = {f} faults (need n >= 2f + 1)")]
    TooFewReplicas { n: u32, f: u32 },

    #[error("Checkpoint period must be positive")]
    ZeroCheckpointPeriod,

    #[error("Logsize {logsize} must exceed checkpoint period {period}")]
    LogsizeTooSmall { logsize: u32, period: u32 },

    #[error("Timeout {0} must be non-zero")]
    ZeroTimeout(&'static str),

    #[error("Replica id {id} out of range for n = {n}")]
    InvalidReplicaId { id: ReplicaId, n: u32 },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaConfig {
    /// Number of replicas
    pub n: u32,

    /// Byzantine replicas tolerated
    pub f: u32,

    /// Executed requests between checkpoints
    pub checkpoint_period: u32,

    /// Width of the watermark window
    pub logsize: u32,

    /// Request timeout before suspecting the primary
    pub timeout_request: Duration,

    /// Base view-change timeout (doubles per failed attempt)
    pub timeout_view_change: Duration,

    /// Upper bound for the backed-off view-change timeout
    pub max_timeout: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            n: 3,
            f: 1,
            checkpoint_period: 100,
            logsize: 200,
            timeout_request: Duration::from_secs(2),
            timeout_view_change: Duration::from_secs(4),
            max_timeout: Duration::from_secs(60),
        }
    }
}

impl ReplicaConfig {
    /// Snapshot an external configuration source
    pub fn from_configer(source: &dyn Configer) -> Self {
        let timeout_view_change = source.timeout_view_change();
        Self {
            n: source.n(),
            f: source.f(),
            checkpoint_period: source.checkpoint_period(),
            logsize: source.logsize(),
            timeout_request: source.timeout_request(),
            timeout_view_change,
            max_timeout: Self::default().max_timeout.max(timeout_view_change),
        }
    }

    /// Startup invariants. A replica refuses to run with a config that
    /// fails here.
    pub fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(ConfigError::NoReplicas);
        }
        if (self.n as u64) < 2 * self.f as u64 + 1 {
            return Err(ConfigError::TooFewReplicas { n: self.n, f: self.f });
        }
        if self.checkpoint_period == 0 {
            return Err(ConfigError::ZeroCheckpointPeriod);
        }
        if self.logsize <= self.checkpoint_period {
            return Err(ConfigError::LogsizeTooSmall {
                logsize: self.logsize,
                period: self.checkpoint_period,
            });
        }
        if self.timeout_request.is_zero() {
            return Err(ConfigError::ZeroTimeout("request"));
        }
        if self.timeout_view_change.is_zero() {
            return Err(ConfigError::ZeroTimeout("view change"));
        }
        Ok(())
    }

    pub fn validate_replica(&self, id: ReplicaId) -> Result<()> {
        self.validate()?;
        if id >= self.n {
            return Err(ConfigError::InvalidReplicaId { id, n: self.n });
        }
        Ok(())
    }

    /// Distinct endorsements (primary's Prepare included) that commit a slot
    pub fn commit_quorum(&self) -> usize {
        self.f as usize + 1
    }

    /// Matching checkpoints that make a checkpoint stable
    pub fn checkpoint_quorum(&self) -> usize {
        self.f as usize + 1
    }

    /// ViewChange votes needed to install a new view
    pub fn view_change_quorum(&self) -> usize {
        (self.n - self.f) as usize
    }

    /// Votes for higher views that force a replica to join
    pub fn join_threshold(&self) -> usize {
        self.f as usize + 1
    }

    pub fn primary(&self, view: View) -> ReplicaId {
        (view % self.n as u64) as ReplicaId
    }

    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> {
        0..self.n
    }
}

impl Configer for ReplicaConfig {
    fn n(&self) -> u32 {
        self.n
    }

    fn f(&self) -> u32 {
        self.f
    }

    fn checkpoint_period(&self) -> u32 {
        self.checkpoint_period
    }

    fn logsize(&self) -> u32 {
        self.logsize
    }

    fn timeout_request(&self) -> Duration {
        self.timeout_request
    }

    fn timeout_view_change(&self) -> Duration {
        self.timeout_view_change
    }
}
