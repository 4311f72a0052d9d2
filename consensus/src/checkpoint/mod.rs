/// Checkpoint management
/// 
/// Every `period` executed requests each replica certifies its state
/// digest with a UI and broadcasts a Checkpoint. F+1 matching Checkpoints
/// make it stable, which lets the Request Log truncate and the watermark
/// window advance.
/// 
/// Also tracks the checkpoint "floor" of every replica: a replica may only
/// author Prepares/Commits for a sequence number once it has broadcast its
/// Checkpoint for the boundary below it.

pub mod types;

use crate::messages::{Checkpoint, CheckpointCertificate, ReplicaId, SeqNum};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use types::{CheckpointStats, Stabilized};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Sequence {0} is not a checkpoint boundary")]
    NotBoundary(SeqNum),

    #[error("Checkpoint {seq} is not above the stable checkpoint {stable}")]
    Stale { seq: SeqNum, stable: SeqNum },

    #[error("Replica {replica_id} sent conflicting digests for checkpoint {seq}")]
    ConflictingCheckpoint { replica_id: ReplicaId, seq: SeqNum },

    #[error("Invalid checkpoint certificate: {0}")]
    InvalidCertificate(String),

    #[error("Stable checkpoint would move backwards: {current} -> {proposed}")]
    Regression { current: SeqNum, proposed: SeqNum },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

pub struct CheckpointManager {
    period: u64,
    quorum: usize,
    logsize: u64,
    stable: CheckpointCertificate,
    /// Local digests at boundaries not yet superseded
    own: BTreeMap<SeqNum, Vec<u8>>,
    /// Checkpoints collected per sequence number
    collected: BTreeMap<SeqNum, BTreeMap<ReplicaId, Checkpoint>>,
    /// Highest Checkpoint processed from each replica
    peer_floor: HashMap<ReplicaId, SeqNum>,
    /// Highest Checkpoint this replica has broadcast
    own_floor: SeqNum,
}

impl CheckpointManager {
    pub fn new(period: u64, quorum: usize, logsize: u64) -> Self {
        Self {
            period: period.max(1),
            quorum,
            logsize,
            stable: CheckpointCertificate::genesis(),
            own: BTreeMap::new(),
            collected: BTreeMap::new(),
            peer_floor: HashMap::new(),
            own_floor: 0,
        }
    }

    pub fn is_boundary(&self, seq: SeqNum) -> bool {
        seq > 0 && seq % self.period == 0
    }

    /// Last boundary strictly below `seq`
    pub fn boundary_below(&self, seq: SeqNum) -> SeqNum {
        seq.saturating_sub(1) / self.period * self.period
    }

    pub fn stable(&self) -> &CheckpointCertificate {
        &self.stable
    }

    pub fn stable_seq(&self) -> SeqNum {
        self.stable.seq
    }

    pub fn own_floor(&self) -> SeqNum {
        self.own_floor
    }

    pub fn own_digest(&self, seq: SeqNum) -> Option<&Vec<u8>> {
        self.own.get(&seq)
    }

    /// Note the local digest at boundary `seq`, just before broadcasting it
    pub fn record_local(&mut self, seq: SeqNum, digest: Vec<u8>) -> Result<()> {
        if !self.is_boundary(seq) {
            return Err(CheckpointError::NotBoundary(seq));
        }
        self.own.insert(seq, digest);
        self.own_floor = self.own_floor.max(seq);
        Ok(())
    }

    /// Whether this replica has checkpointed far enough to author `seq`
    pub fn may_author(&self, seq: SeqNum) -> bool {
        self.boundary_below(seq) <= self.own_floor.max(self.stable.seq)
    }

    /// Whether `replica_id` has checkpointed far enough to author `seq`
    pub fn peer_may_author(&self, replica_id: ReplicaId, seq: SeqNum) -> bool {
        let floor = self.peer_floor.get(&replica_id).copied().unwrap_or(0);
        self.boundary_below(seq) <= floor.max(self.stable.seq)
    }

    pub fn note_peer_checkpoint(&mut self, replica_id: ReplicaId, seq: SeqNum) {
        let floor = self.peer_floor.entry(replica_id).or_insert(0);
        *floor = (*floor).max(seq);
    }

    /// Collect a Checkpoint (own or peer). Returns the stabilized
    /// certificate when this message completes a quorum.
    pub fn on_checkpoint_message(&mut self, checkpoint: &Checkpoint) -> Result<Option<Stabilized>> {
        if !self.is_boundary(checkpoint.seq) {
            return Err(CheckpointError::NotBoundary(checkpoint.seq));
        }
        self.note_peer_checkpoint(checkpoint.replica_id, checkpoint.seq);
        if checkpoint.seq <= self.stable.seq {
            return Err(CheckpointError::Stale {
                seq: checkpoint.seq,
                stable: self.stable.seq,
            });
        }

        if checkpoint.seq >= self.stable.seq + self.logsize {
            // Past the window each replica keeps a single vote, its latest
            self.forget_votes_beyond_window(checkpoint.replica_id, checkpoint.seq);
        }
        let votes = self.collected.entry(checkpoint.seq).or_default();
        if let Some(previous) = votes.get(&checkpoint.replica_id) {
            if previous.state_digest != checkpoint.state_digest {
                warn!(
                    "Replica {} sent conflicting checkpoints at {}",
                    checkpoint.replica_id, checkpoint.seq
                );
                return Err(CheckpointError::ConflictingCheckpoint {
                    replica_id: checkpoint.replica_id,
                    seq: checkpoint.seq,
                });
            }
            return Ok(None);
        }
        votes.insert(checkpoint.replica_id, checkpoint.clone());

        let matching: Vec<Checkpoint> = votes
            .values()
            .filter(|c| c.state_digest == checkpoint.state_digest)
            .cloned()
            .collect();
        if matching.len() < self.quorum {
            debug!(
                "Checkpoint {} has {}/{} matching votes",
                checkpoint.seq,
                matching.len(),
                self.quorum
            );
            return Ok(None);
        }

        let dissenters = votes
            .values()
            .filter(|c| c.state_digest != checkpoint.state_digest)
            .map(|c| c.replica_id)
            .collect();
        let certificate = CheckpointCertificate {
            seq: checkpoint.seq,
            state_digest: checkpoint.state_digest.clone(),
            checkpoints: matching,
        };
        let own_digest = self.own.get(&checkpoint.seq).cloned();
        self.install(certificate.clone());
        info!("Checkpoint {} is stable", certificate.seq);

        Ok(Some(Stabilized {
            certificate,
            dissenters,
            own_digest,
        }))
    }

    /// Adopt a verified certificate learned from a view change. Returns
    /// whether the stable checkpoint advanced.
    pub fn adopt(&mut self, certificate: &CheckpointCertificate) -> Result<bool> {
        if certificate.seq < self.stable.seq {
            return Err(CheckpointError::Regression {
                current: self.stable.seq,
                proposed: certificate.seq,
            });
        }
        if certificate.seq == self.stable.seq {
            return Ok(false);
        }
        self.install(certificate.clone());
        Ok(true)
    }

    /// Structural and cryptographic check of a certificate
    pub fn verify_certificate<F>(&self, certificate: &CheckpointCertificate, verify_ui: F) -> Result<()>
    where
        F: Fn(&Checkpoint) -> bool,
    {
        verify_certificate(certificate, self.period, self.quorum, verify_ui)
    }

    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            stable_seq: self.stable.seq,
            own_floor: self.own_floor,
            collecting: self.collected.len(),
        }
    }

    /// Drop `replica_id`'s votes past the window other than at `keep`
    fn forget_votes_beyond_window(&mut self, replica_id: ReplicaId, keep: SeqNum) {
        let horizon = self.stable.seq + self.logsize;
        let mut emptied = Vec::new();
        for (&seq, votes) in self.collected.range_mut(horizon..) {
            if seq != keep && votes.remove(&replica_id).is_some() && votes.is_empty() {
                emptied.push(seq);
            }
        }
        for seq in emptied {
            self.collected.remove(&seq);
        }
    }

    fn install(&mut self, certificate: CheckpointCertificate) {
        let seq = certificate.seq;
        self.collected = self.collected.split_off(&(seq + 1));
        // Keep the own digest at `seq` for the divergence check
        self.own = self.own.split_off(&seq);
        self.stable = certificate;
    }
}

/// Check that `certificate` holds `quorum` matching Checkpoints from
/// distinct replicas at a boundary of `period`. `verify_ui` checks each
/// member Checkpoint's UI. The genesis certificate is always valid.
pub fn verify_certificate<F>(
    certificate: &CheckpointCertificate,
    period: u64,
    quorum: usize,
    verify_ui: F,
) -> Result<()>
where
    F: Fn(&Checkpoint) -> bool,
{
    if certificate.is_genesis() {
        if !certificate.checkpoints.is_empty() || !certificate.state_digest.is_empty() {
            return Err(CheckpointError::InvalidCertificate(
                "genesis certificate carries data".into(),
            ));
        }
        return Ok(());
    }
    if certificate.seq % period.max(1) != 0 {
        return Err(CheckpointError::NotBoundary(certificate.seq));
    }
    let mut signers = BTreeSet::new();
    for checkpoint in &certificate.checkpoints {
        if checkpoint.seq != certificate.seq || checkpoint.state_digest != certificate.state_digest {
            return Err(CheckpointError::InvalidCertificate(format!(
                "member from replica {} does not match",
                checkpoint.replica_id
            )));
        }
        if !verify_ui(checkpoint) {
            return Err(CheckpointError::InvalidCertificate(format!(
                "bad UI from replica {}",
                checkpoint.replica_id
            )));
        }
        signers.insert(checkpoint.replica_id);
    }
    if signers.len() < quorum {
        return Err(CheckpointError::InvalidCertificate(format!(
            "{} distinct signers, need {}",
            signers.len(),
            quorum
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ui;

    fn checkpoint(replica: ReplicaId, seq: SeqNum, digest: &[u8]) -> Checkpoint {
        let mut c = Checkpoint::new(replica, seq, digest.to_vec());
        c.ui = Ui::new(seq, vec![]);
        c
    }

    #[test]
    fn test_boundaries() {
        let manager = CheckpointManager::new(100, 2, 200);
        assert!(!manager.is_boundary(0));
        assert!(manager.is_boundary(100));
        assert!(!manager.is_boundary(150));
        assert_eq!(manager.boundary_below(1), 0);
        assert_eq!(manager.boundary_below(100), 0);
        assert_eq!(manager.boundary_below(101), 100);
        assert_eq!(manager.boundary_below(200), 100);
    }

    #[test]
    fn test_stabilizes_on_matching_quorum() {
        let mut manager = CheckpointManager::new(100, 2, 200);
        manager.record_local(100, b"d".to_vec()).unwrap();

        assert!(manager
            .on_checkpoint_message(&checkpoint(0, 100, b"d"))
            .unwrap()
            .is_none());
        assert!(manager
            .on_checkpoint_message(&checkpoint(2, 100, b"other"))
            .unwrap()
            .is_none());
        let stable = manager
            .on_checkpoint_message(&checkpoint(1, 100, b"d"))
            .unwrap()
            .unwrap();

        assert_eq!(stable.seq(), 100);
        assert_eq!(stable.dissenters, vec![2]);
        assert!(!stable.diverges());
        assert_eq!(manager.stable_seq(), 100);
        assert_eq!(stable.certificate.checkpoints.len(), 2);
    }

    #[test]
    fn test_divergent_local_state_detected() {
        let mut manager = CheckpointManager::new(10, 2, 40);
        manager.record_local(10, b"mine".to_vec()).unwrap();
        manager.on_checkpoint_message(&checkpoint(1, 10, b"theirs")).unwrap();
        let stable = manager
            .on_checkpoint_message(&checkpoint(2, 10, b"theirs"))
            .unwrap()
            .unwrap();
        assert!(stable.diverges());
    }

    #[test]
    fn test_stable_checkpoint_is_monotonic() {
        let mut manager = CheckpointManager::new(10, 1, 40);
        manager.on_checkpoint_message(&checkpoint(0, 20, b"d")).unwrap();
        assert_eq!(
            manager.on_checkpoint_message(&checkpoint(1, 10, b"d")),
            Err(CheckpointError::Stale { seq: 10, stable: 20 })
        );
        let older = CheckpointCertificate {
            seq: 10,
            state_digest: b"d".to_vec(),
            checkpoints: vec![checkpoint(0, 10, b"d")],
        };
        assert!(matches!(
            manager.adopt(&older),
            Err(CheckpointError::Regression { current: 20, proposed: 10 })
        ));
    }

    #[test]
    fn test_conflicting_checkpoint_from_same_replica() {
        let mut manager = CheckpointManager::new(10, 3, 40);
        manager.on_checkpoint_message(&checkpoint(1, 10, b"a")).unwrap();
        assert_eq!(
            manager.on_checkpoint_message(&checkpoint(1, 10, b"b")),
            Err(CheckpointError::ConflictingCheckpoint { replica_id: 1, seq: 10 })
        );
    }

    #[test]
    fn test_authoring_floor() {
        let mut manager = CheckpointManager::new(10, 2, 40);
        assert!(manager.may_author(10));
        assert!(!manager.may_author(11));
        manager.record_local(10, vec![1]).unwrap();
        assert!(manager.may_author(20));

        assert!(!manager.peer_may_author(3, 11));
        manager.note_peer_checkpoint(3, 10);
        assert!(manager.peer_may_author(3, 11));
        assert!(!manager.peer_may_author(3, 21));
    }

    #[test]
    fn test_verify_certificate() {
        let manager = CheckpointManager::new(10, 2, 40);
        let cert = CheckpointCertificate {
            seq: 10,
            state_digest: b"d".to_vec(),
            checkpoints: vec![checkpoint(0, 10, b"d"), checkpoint(1, 10, b"d")],
        };
        assert!(manager.verify_certificate(&cert, |_| true).is_ok());
        assert!(manager.verify_certificate(&cert, |c| c.replica_id != 1).is_err());

        let mut duplicated = cert.clone();
        duplicated.checkpoints[1] = checkpoint(0, 10, b"d");
        assert!(manager.verify_certificate(&duplicated, |_| true).is_err());

        assert!(manager
            .verify_certificate(&CheckpointCertificate::genesis(), |_| false)
            .is_ok());
    }

    #[test]
    fn test_votes_beyond_window_are_bounded_per_replica() {
        let mut manager = CheckpointManager::new(10, 2, 40);
        manager.on_checkpoint_message(&checkpoint(1, 10, b"d")).unwrap();
        for seq in (40..=5000).step_by(10) {
            manager.on_checkpoint_message(&checkpoint(3, seq, b"x")).unwrap();
        }
        // One in-window vote plus the latest far vote of replica 3
        assert_eq!(manager.stats().collecting, 2);

        // A lagging replica still learns a far checkpoint from a quorum
        manager.on_checkpoint_message(&checkpoint(2, 90, b"far")).unwrap();
        let stable = manager
            .on_checkpoint_message(&checkpoint(0, 90, b"far"))
            .unwrap()
            .unwrap();
        assert_eq!(stable.seq(), 90);
        assert_eq!(manager.stats().collecting, 1);
    }
}
