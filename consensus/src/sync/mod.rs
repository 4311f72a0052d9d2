/// State-transfer boundary
/// 
/// A replica that learns of a stable checkpoint it has not executed up to
/// cannot truncate its log and must fetch application state from peers.
/// The transfer protocol itself lives outside the core; `SyncTracker`
/// records the outstanding target and checks the installed state against
/// the certified digest when the surrounding process reports completion.

use crate::messages::SeqNum;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("No state transfer is in progress")]
    NotSyncing,

    #[error("State transfer to {0} already in progress")]
    SyncInProgress(SeqNum),

    #[error("Transferred state at {seq} does not match the certified digest")]
    DigestMismatch { seq: SeqNum },

    #[error("Transferred state at {got} is behind the target {target}")]
    BehindTarget { target: SeqNum, got: SeqNum },
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// The state a lagging replica has to reach
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncTarget {
    pub seq: SeqNum,
    pub state_digest: Vec<u8>,
}

#[derive(Debug)]
struct InFlight {
    target: SyncTarget,
    started_at: Instant,
}

#[derive(Debug, Default)]
pub struct SyncTracker {
    in_flight: Option<InFlight>,
    completed: u64,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn target(&self) -> Option<&SyncTarget> {
        self.in_flight.as_ref().map(|s| &s.target)
    }

    /// Start tracking a transfer to `target`. A newer target replaces an
    /// older one; an equal or older target is rejected.
    pub fn begin(&mut self, target: SyncTarget) -> Result<()> {
        if let Some(current) = &self.in_flight {
            if current.target.seq >= target.seq {
                return Err(SyncError::SyncInProgress(current.target.seq));
            }
            warn!(
                "Replacing state transfer target {} with {}",
                current.target.seq, target.seq
            );
        }
        info!("State transfer needed up to sequence {}", target.seq);
        self.in_flight = Some(InFlight {
            target,
            started_at: Instant::now(),
        });
        Ok(())
    }

    /// Check the installed state and finish the transfer
    pub fn complete(&mut self, seq: SeqNum, state_digest: &[u8]) -> Result<SyncTarget> {
        let in_flight = self.in_flight.as_ref().ok_or(SyncError::NotSyncing)?;
        if seq < in_flight.target.seq {
            return Err(SyncError::BehindTarget {
                target: in_flight.target.seq,
                got: seq,
            });
        }
        if seq == in_flight.target.seq && state_digest != in_flight.target.state_digest.as_slice() {
            return Err(SyncError::DigestMismatch { seq });
        }
        let done = self.in_flight.take().ok_or(SyncError::NotSyncing)?;
        self.completed += 1;
        info!(
            "State transfer to {} completed in {:?}",
            seq,
            done.started_at.elapsed()
        );
        Ok(done.target)
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}
