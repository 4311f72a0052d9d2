/// Observable replica events

use crate::messages::{ClientId, ReplicaId, SeqNum, View};
use crate::ordering::OrderingViolation;
use crate::sync::SyncTarget;
use crate::view_change::ViewChangeReason;
use std::fmt;

/// Misbehaviour proven by signed messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Evidence {
    /// Two payloads certified with the same UI counter
    Equivocation { counter: u64 },
    /// Two different Prepares for one (view, seq)
    ConflictingPrepare { view: View, seq: SeqNum },
    /// Prepare that breaks the primary's sequencing rules
    Ordering(OrderingViolation),
    /// Commit endorsing a Prepare that its primary could not have sent
    InvalidCommit { view: View, seq: SeqNum },
    ConflictingCommit { view: View, seq: SeqNum },
    ConflictingCheckpoint { seq: SeqNum },
    /// Checkpoint at a sequence number that is not a boundary
    MisalignedCheckpoint { seq: SeqNum },
    /// Digest disagreeing with a stable checkpoint
    CheckpointDissent { seq: SeqNum },
    /// Prepare or Commit authored before the author's own checkpoint
    CheckpointStall { seq: SeqNum },
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evidence::Equivocation { counter } => write!(f, "equivocation on counter {}", counter),
            Evidence::ConflictingPrepare { view, seq } => {
                write!(f, "conflicting prepare for view {} seq {}", view, seq)
            }
            Evidence::Ordering(violation) => write!(f, "{}", violation),
            Evidence::InvalidCommit { view, seq } => {
                write!(f, "invalid commit for view {} seq {}", view, seq)
            }
            Evidence::ConflictingCommit { view, seq } => {
                write!(f, "conflicting commit for view {} seq {}", view, seq)
            }
            Evidence::ConflictingCheckpoint { seq } => write!(f, "conflicting checkpoint {}", seq),
            Evidence::MisalignedCheckpoint { seq } => write!(f, "checkpoint off boundary at {}", seq),
            Evidence::CheckpointDissent { seq } => write!(f, "dissenting checkpoint {}", seq),
            Evidence::CheckpointStall { seq } => {
                write!(f, "authored seq {} before checkpointing", seq)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicaEvent {
    RequestExecuted {
        seq: SeqNum,
        client_id: ClientId,
        timestamp: u64,
    },
    CheckpointStable {
        seq: SeqNum,
    },
    ViewChangeStarted {
        view: View,
        reason: ViewChangeReason,
    },
    NewViewInstalled {
        view: View,
        primary: ReplicaId,
    },
    ByzantineEvidence {
        replica_id: ReplicaId,
        evidence: Evidence,
    },
    /// Stable checkpoint above the executed state; the application state
    /// must be fetched and `complete_state_transfer` called
    StateTransferNeeded {
        target: SyncTarget,
    },
    /// Local state contradicts a quorum; the replica halted ordering
    ConsistencyFailure {
        seq: SeqNum,
        detail: String,
    },
    PeerUnreachable {
        replica_id: ReplicaId,
    },
}
