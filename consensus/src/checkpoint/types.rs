/// Checkpoint outcomes and statistics

use crate::messages::{CheckpointCertificate, ReplicaId, SeqNum};

/// A checkpoint that just became stable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stabilized {
    pub certificate: CheckpointCertificate,
    /// Replicas that reported a different digest for the same sequence
    pub dissenters: Vec<ReplicaId>,
    /// The local digest at that sequence, if this replica has reached it
    pub own_digest: Option<Vec<u8>>,
}

impl Stabilized {
    pub fn seq(&self) -> SeqNum {
        self.certificate.seq
    }

    /// Local state diverges from what a quorum certified
    pub fn diverges(&self) -> bool {
        self.own_digest
            .as_ref()
            .is_some_and(|own| *own != self.certificate.state_digest)
    }
}

/// Snapshot of checkpoint bookkeeping
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub stable_seq: SeqNum,
    pub own_floor: SeqNum,
    pub collecting: usize,
}
