// Checkpoints and watermark advance

use super::{Evidence, Output, ReplicaCore, ReplicaEvent};
use crate::checkpoint::{CheckpointError, Stabilized};
use crate::messages::{Checkpoint, CheckpointCertificate, LoggedMessage, SeqNum};
use crate::sync::{SyncError, SyncTarget};
use tracing::{debug, info, warn};

impl ReplicaCore {
    /// Certify and broadcast the local state digest at boundary `seq`
    pub(super) fn take_checkpoint(&mut self, seq: SeqNum, out: &mut Output) {
        let digest = self.consumer.state_digest();
        if let Err(e) = self.checkpoints.record_local(seq, digest.clone()) {
            warn!("Replica {} cannot checkpoint at {}: {}", self.id, seq, e);
            return;
        }
        let Some(checkpoint) = self.seal(Checkpoint::new(self.id, seq, digest)) else {
            return;
        };
        debug!("Replica {} checkpoints at {}", self.id, seq);
        out.broadcast(checkpoint.clone());

        match self.checkpoints.on_checkpoint_message(&checkpoint) {
            Ok(Some(stabilized)) => self.on_stabilized(stabilized, out),
            Ok(None) => {}
            Err(CheckpointError::Stale { .. }) => self.caught_up(&checkpoint, out),
            Err(e) => warn!("Own checkpoint {} rejected: {}", seq, e),
        }
        self.flush_deferred_commits(out);
        self.propose_pending(out);
    }

    /// The checkpoint became stable before this replica executed up to
    /// it; reaching it by ordinary execution ends any pending transfer
    fn caught_up(&mut self, own: &Checkpoint, out: &mut Output) {
        let stable = self.checkpoints.stable().clone();
        if stable.seq != own.seq {
            return;
        }
        if stable.state_digest != own.state_digest {
            self.consistency_failure(
                own.seq,
                "local state digest differs from the stable checkpoint".into(),
                out,
            );
            return;
        }
        if self.sync.target().is_some_and(|target| target.seq <= own.seq) {
            match self.sync.complete(own.seq, &own.state_digest) {
                Ok(_) => info!("Replica {} caught up to {} without state transfer", self.id, own.seq),
                Err(e) => warn!("Replica {} could not close state transfer: {}", self.id, e),
            }
        }
        self.advance_watermark(&stable, out);
    }

    pub(super) fn apply_checkpoint(&mut self, checkpoint: Checkpoint, out: &mut Output) {
        let (replica_id, seq) = (checkpoint.replica_id, checkpoint.seq);
        match self.checkpoints.on_checkpoint_message(&checkpoint) {
            Ok(Some(stabilized)) => self.on_stabilized(stabilized, out),
            Ok(None) | Err(CheckpointError::Stale { .. }) => {}
            Err(CheckpointError::NotBoundary(seq)) => {
                self.report_evidence(replica_id, Evidence::MisalignedCheckpoint { seq }, out);
            }
            Err(CheckpointError::ConflictingCheckpoint { replica_id, seq }) => {
                self.report_evidence(replica_id, Evidence::ConflictingCheckpoint { seq }, out);
            }
            Err(e) => warn!("Checkpoint {} from replica {} rejected: {}", seq, replica_id, e),
        }
    }

    fn on_stabilized(&mut self, stabilized: Stabilized, out: &mut Output) {
        let seq = stabilized.seq();
        for &replica_id in &stabilized.dissenters {
            self.report_evidence(replica_id, Evidence::CheckpointDissent { seq }, out);
        }
        out.event(ReplicaEvent::CheckpointStable { seq });
        debug!("Replica {} checkpoints: {:?}", self.id, self.checkpoints.stats());
        if stabilized.diverges() {
            self.consistency_failure(
                seq,
                "local state digest differs from the stable checkpoint".into(),
                out,
            );
            return;
        }
        self.advance_watermark(&stabilized.certificate, out);
    }

    /// Move the window up to a stable certificate, or ask for state
    /// transfer if this replica has not executed that far
    pub(super) fn advance_watermark(&mut self, certificate: &CheckpointCertificate, out: &mut Output) {
        let seq = certificate.seq;
        if self.log.last_executed() < seq {
            let target = SyncTarget {
                seq,
                state_digest: certificate.state_digest.clone(),
            };
            match self.sync.begin(target.clone()) {
                Ok(()) => out.event(ReplicaEvent::StateTransferNeeded { target }),
                Err(SyncError::SyncInProgress(current)) => {
                    debug!("State transfer to {} already in progress", current)
                }
                Err(e) => warn!("Cannot start state transfer: {}", e),
            }
            return;
        }
        if let Err(e) = self.log.truncate_before(seq) {
            warn!("Replica {} cannot truncate at {}: {}", self.id, seq, e);
            return;
        }
        self.prune_sent_log(seq);
        info!(
            "Replica {} advanced its window to ({}, {})",
            self.id,
            self.log.low_watermark(),
            self.log.high_watermark()
        );
        self.reapply_deferred(out);
        self.propose_pending(out);
    }

    /// Drop own log entries older than the checkpoint a ViewChange would
    /// anchor on
    pub(super) fn prune_sent_log(&mut self, stable: SeqNum) {
        let anchor = self.sent_log.iter().rposition(|entry| {
            matches!(entry, LoggedMessage::Checkpoint(c) if c.seq <= stable)
        });
        if let Some(index) = anchor {
            self.sent_log.drain(..index);
        }
    }

    /// Re-run messages parked above the old window
    pub(super) fn reapply_deferred(&mut self, out: &mut Output) {
        if self.deferred.is_empty() {
            return;
        }
        let parked = std::mem::take(&mut self.deferred);
        debug!("Replica {} re-applies {} deferred messages", self.id, parked.len());
        for message in parked {
            self.apply(message, out);
        }
    }
}
