/// Request Log
/// 
/// Bounded ledger of in-flight and recently committed requests, keyed by
/// sequence number. Accepts new Prepares only inside the watermark window
/// `(low, low + logsize)`, where `low` is the last stable checkpoint.
/// Truncation never drops a slot that has not been executed.

pub mod slot;

use crate::messages::{Commit, Prepare, ReplicaId, SeqNum, View};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

pub use slot::{Slot, SlotState};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Sequence {seq} is at or below the low watermark {low}")]
    BelowWatermark { seq: SeqNum, low: SeqNum },

    #[error("Sequence {seq} is beyond the high watermark {high}")]
    AboveWatermark { seq: SeqNum, high: SeqNum },

    #[error("Conflicting Prepare for view {view}, sequence {seq}")]
    ConflictingPrepare { view: View, seq: SeqNum },

    #[error("Prepare for sequence {seq} contradicts its committed request")]
    CommittedConflict { seq: SeqNum },

    #[error("Replica {replica_id} sent conflicting Commits for view {view}, sequence {seq}")]
    ConflictingCommit {
        replica_id: ReplicaId,
        view: View,
        seq: SeqNum,
    },

    #[error("Sequence {0} has not been executed")]
    UnexecutedSlot(SeqNum),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// What `admit` did with a Prepare
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// New proposal for this slot
    Fresh,
    /// Same Prepare seen before
    Duplicate,
    /// Re-proposal in a later view of a request already committed here
    Recommitted,
}

pub struct RequestLog {
    low: SeqNum,
    logsize: u64,
    quorum: usize,
    last_executed: SeqNum,
    slots: BTreeMap<SeqNum, Slot>,
}

impl RequestLog {
    pub fn new(logsize: u64, quorum: usize) -> Self {
        Self {
            low: 0,
            logsize,
            quorum,
            last_executed: 0,
            slots: BTreeMap::new(),
        }
    }

    pub fn low_watermark(&self) -> SeqNum {
        self.low
    }

    /// First sequence number outside the window
    pub fn high_watermark(&self) -> SeqNum {
        self.low + self.logsize
    }

    pub fn last_executed(&self) -> SeqNum {
        self.last_executed
    }

    pub fn in_window(&self, seq: SeqNum) -> bool {
        seq > self.low && seq < self.high_watermark()
    }

    pub fn check_window(&self, seq: SeqNum) -> Result<()> {
        if seq <= self.low {
            return Err(LogError::BelowWatermark { seq, low: self.low });
        }
        if seq >= self.high_watermark() {
            return Err(LogError::AboveWatermark {
                seq,
                high: self.high_watermark(),
            });
        }
        Ok(())
    }

    pub fn slot_at(&self, seq: SeqNum) -> Option<&Slot> {
        self.slots.get(&seq)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    /// Record a validated Prepare. `Empty -> Prepared` on a fresh slot.
    pub fn admit(&mut self, prepare: &Prepare) -> Result<Admission> {
        self.check_window(prepare.seq)?;
        let slot = self
            .slots
            .entry(prepare.seq)
            .or_insert_with(|| Slot::new(prepare.seq));

        if let Some(existing) = &slot.prepare {
            if existing.view == prepare.view {
                if existing == prepare {
                    return Ok(Admission::Duplicate);
                }
                return Err(LogError::ConflictingPrepare {
                    view: prepare.view,
                    seq: prepare.seq,
                });
            }
            if existing.view > prepare.view {
                return Err(LogError::ConflictingPrepare {
                    view: prepare.view,
                    seq: prepare.seq,
                });
            }
        }

        if slot.is_committed() {
            let same_request = slot.request().map(|r| r.digest()) == Some(prepare.request.digest());
            if !same_request {
                return Err(LogError::CommittedConflict { seq: prepare.seq });
            }
            if let Some(old) = slot.prepare.replace(prepare.clone()) {
                slot.superseded.push(old);
            }
            return Ok(Admission::Recommitted);
        }

        if let Some(old) = slot.prepare.replace(prepare.clone()) {
            slot.superseded.push(old);
        }
        slot.state = SlotState::Prepared;
        slot.abandoned = false;
        debug!("Slot {} prepared in view {}", prepare.seq, prepare.view);
        Ok(Admission::Fresh)
    }

    /// Record a validated Commit. Commits may precede their Prepare.
    pub fn record_commit(&mut self, commit: &Commit) -> Result<()> {
        self.check_window(commit.seq)?;
        let slot = self
            .slots
            .entry(commit.seq)
            .or_insert_with(|| Slot::new(commit.seq));

        if let Some(existing) = slot.commits.get(&commit.replica_id) {
            if existing.view == commit.view && existing != commit {
                warn!(
                    "Replica {} sent conflicting Commits for slot {}",
                    commit.replica_id, commit.seq
                );
                return Err(LogError::ConflictingCommit {
                    replica_id: commit.replica_id,
                    view: commit.view,
                    seq: commit.seq,
                });
            }
            if existing.view >= commit.view {
                return Ok(());
            }
        }
        slot.commits.insert(commit.replica_id, commit.clone());
        Ok(())
    }

    /// `Prepared -> CommittedLocally` once the replica has endorsed the slot
    pub fn mark_committed_locally(&mut self, seq: SeqNum) {
        if let Some(slot) = self.slots.get_mut(&seq) {
            if slot.state == SlotState::Prepared {
                slot.state = SlotState::CommittedLocally;
            }
        }
    }

    /// `CommittedLocally -> QuorumCommitted` when enough matching
    /// endorsements are present. Returns true on the transition.
    pub fn refresh_quorum(&mut self, seq: SeqNum) -> bool {
        let quorum = self.quorum;
        match self.slots.get_mut(&seq) {
            Some(slot) if slot.state == SlotState::CommittedLocally => {
                if slot.endorsements() >= quorum {
                    slot.state = SlotState::QuorumCommitted;
                    debug!("Slot {} reached commit quorum", seq);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// The slot that can execute next, if it is committed
    pub fn next_executable(&self) -> Option<&Slot> {
        self.slots
            .get(&(self.last_executed + 1))
            .filter(|slot| slot.state == SlotState::QuorumCommitted)
    }

    /// `QuorumCommitted -> Executed`, strictly in sequence order
    pub fn mark_executed(&mut self, seq: SeqNum, result: Vec<u8>) -> Result<()> {
        if seq != self.last_executed + 1 {
            return Err(LogError::UnexecutedSlot(self.last_executed + 1));
        }
        let slot = self
            .slots
            .get_mut(&seq)
            .filter(|slot| slot.state == SlotState::QuorumCommitted)
            .ok_or(LogError::UnexecutedSlot(seq))?;
        slot.state = SlotState::Executed;
        slot.result = Some(result);
        self.last_executed = seq;
        Ok(())
    }

    /// Drop every slot below `seq` and move the low watermark to `seq`.
    /// Refuses while any of those slots is unexecuted.
    pub fn truncate_before(&mut self, seq: SeqNum) -> Result<()> {
        if seq <= self.low {
            return Ok(());
        }
        if self.last_executed < seq {
            return Err(LogError::UnexecutedSlot(self.last_executed + 1));
        }
        self.slots = self.slots.split_off(&seq);
        self.low = seq;
        debug!("Log truncated; window is now ({}, {})", self.low, self.high_watermark());
        Ok(())
    }

    /// Cancel in-flight slots of views before `view`. Committed slots are
    /// carried forward untouched. Returns the abandoned sequence numbers.
    pub fn abandon_stale(&mut self, view: View) -> Vec<SeqNum> {
        let mut abandoned = Vec::new();
        for slot in self.slots.values_mut() {
            if slot.is_committed() {
                continue;
            }
            if slot.view().is_some_and(|v| v < view) {
                if let Some(old) = slot.prepare.take() {
                    slot.superseded.push(old);
                }
                slot.state = SlotState::Empty;
                slot.abandoned = true;
                abandoned.push(slot.seq);
            }
            slot.commits.retain(|_, c| c.view >= view);
        }
        abandoned
    }

    /// Adopt a transferred state at `seq`: everything at or below it is
    /// treated as executed.
    pub fn install_snapshot(&mut self, seq: SeqNum) {
        self.slots = self.slots.split_off(&(seq + 1));
        self.low = self.low.max(seq);
        self.last_executed = self.last_executed.max(seq);
    }
}
