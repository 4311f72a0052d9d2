// Normal-case ordering
//
// Client requests, the primary's proposals, Prepare/Commit handling and
// in-order execution.

use super::{Evidence, Output, ReplicaCore, ReplicaEvent, TimerKind, Timeout};
use crate::messages::{Commit, Prepare, ReplicaId, Reply, Request, SeqNum, UiMessage, View};
use crate::ordering::{Execution, RequestAdmission};
use crate::request_log::{Admission, LogError, SlotState};
use tracing::{debug, error, info, warn};

impl ReplicaCore {
    pub(super) fn on_request(&mut self, request: Request, out: &mut Output) {
        match self.ordering.on_client_request(&request) {
            RequestAdmission::CachedReply(reply) => {
                debug!("Resending cached reply to client {}", reply.client_id);
                out.reply(reply);
            }
            RequestAdmission::Stale | RequestAdmission::AlreadyPending => {}
            RequestAdmission::Accepted => {
                debug!("Replica {} accepted {:?}", self.id, request);
                self.refresh_request_timer(out);
                self.propose_pending(out);
            }
        }
    }

    /// Arm the request timer while accepted requests are unexecuted
    pub(super) fn refresh_request_timer(&mut self, out: &mut Output) {
        if !self.pacemaker.is_normal() {
            return;
        }
        if self.ordering.has_pending() {
            if !self.request_timer_armed {
                out.start_timer(Timeout::Request, self.config.timeout_request);
                self.request_timer_armed = true;
            }
        } else if self.request_timer_armed {
            out.stop_timer(TimerKind::Request);
            self.request_timer_armed = false;
        }
    }

    /// First sequence number the primary may not propose yet: bounded by
    /// the window and by its own last broadcast checkpoint
    fn proposal_limit(&self) -> SeqNum {
        let floor = self.checkpoints.own_floor().max(self.checkpoints.stable_seq());
        let stall = floor + self.config.checkpoint_period as u64 + 1;
        self.log.high_watermark().min(stall)
    }

    /// As primary, assign sequence numbers to queued requests
    pub(super) fn propose_pending(&mut self, out: &mut Output) {
        if self.halted || !self.pacemaker.is_primary(self.id) {
            return;
        }
        loop {
            let limit = self.proposal_limit();
            let Some((seq, request)) = self.ordering.take_proposal(limit) else {
                return;
            };
            let prepare = Prepare::new(self.pacemaker.current_view(), self.id, seq, request);
            let Some(prepare) = self.seal(prepare) else {
                return;
            };
            if let Err(e) = self.log.admit(&prepare) {
                error!("Primary {} cannot log its own Prepare {}: {}", self.id, seq, e);
                return;
            }
            debug!(
                "Primary {} proposes {:?} at seq {} in view {}",
                self.id, prepare.request, seq, prepare.view
            );
            self.ordering.note_prepared(&prepare);
            self.log.mark_committed_locally(seq);
            out.broadcast(prepare);
            self.try_quorum(seq, out);
        }
    }

    pub(super) fn apply_prepare(&mut self, prepare: Prepare, out: &mut Output) {
        let view = self.pacemaker.current_view();
        if !(self.pacemaker.is_normal() && prepare.view == view) {
            if prepare.view > view && prepare.view >= self.pacemaker.target_view() {
                let (target, primary) = (prepare.view, prepare.replica_id);
                self.park_future_view(target, primary, UiMessage::Prepare(prepare));
            } else {
                debug!("Ignoring Prepare for stale view {}", prepare.view);
            }
            return;
        }

        let primary = self.pacemaker.current_primary();
        if !self.checkpoints.peer_may_author(prepare.replica_id, prepare.seq) {
            let seq = prepare.seq;
            self.report_evidence(prepare.replica_id, Evidence::CheckpointStall { seq }, out);
            return;
        }

        match self.log.check_window(prepare.seq) {
            Ok(()) => {}
            Err(LogError::BelowWatermark { seq, low }) => {
                // Covered by a stable checkpoint; only the sequencing moves on
                if self.ordering.check_prepare(&prepare, primary).is_ok() {
                    self.ordering.note_prepared(&prepare);
                }
                debug!("Prepare {} below the low watermark {}", seq, low);
                return;
            }
            Err(_) => {
                self.defer(UiMessage::Prepare(prepare));
                return;
            }
        }

        if let Err(violation) = self.ordering.check_prepare(&prepare, primary) {
            let conflicting = self.log.slot_at(prepare.seq).is_some_and(|slot| {
                slot.view() == Some(prepare.view) && slot.prepare.as_ref() != Some(&prepare)
            });
            let evidence = if conflicting {
                Evidence::ConflictingPrepare {
                    view: prepare.view,
                    seq: prepare.seq,
                }
            } else {
                Evidence::Ordering(violation)
            };
            self.report_evidence(prepare.replica_id, evidence, out);
            return;
        }

        match self.log.admit(&prepare) {
            Ok(Admission::Fresh) | Ok(Admission::Recommitted) => {}
            Ok(Admission::Duplicate) => return,
            Err(LogError::ConflictingPrepare { view, seq }) => {
                self.report_evidence(
                    prepare.replica_id,
                    Evidence::ConflictingPrepare { view, seq },
                    out,
                );
                return;
            }
            Err(LogError::CommittedConflict { seq }) => {
                self.consistency_failure(
                    seq,
                    "new-view proposal contradicts a committed request".into(),
                    out,
                );
                return;
            }
            Err(e) => {
                warn!("Prepare {} not admitted: {}", prepare.seq, e);
                return;
            }
        }
        self.ordering.note_prepared(&prepare);

        if self.checkpoints.may_author(prepare.seq) {
            self.send_commit(&prepare, out);
        } else {
            debug!(
                "Replica {} holds its Commit for {} until checkpoint {}",
                self.id,
                prepare.seq,
                self.checkpoints.boundary_below(prepare.seq)
            );
            self.deferred_commits.insert(prepare.seq, prepare);
        }
    }

    /// Endorse `prepare` with an own Commit
    pub(super) fn send_commit(&mut self, prepare: &Prepare, out: &mut Output) {
        let Some(commit) = self.seal(Commit::for_prepare(self.id, prepare)) else {
            return;
        };
        if let Err(e) = self.log.record_commit(&commit) {
            warn!("Own Commit for {} not recorded: {}", commit.seq, e);
        }
        self.log.mark_committed_locally(prepare.seq);
        out.broadcast(commit);
        self.try_quorum(prepare.seq, out);
    }

    pub(super) fn apply_commit(&mut self, commit: Commit, out: &mut Output) {
        let view = self.pacemaker.current_view();
        if !(self.pacemaker.is_normal() && commit.view == view) {
            if commit.view > view && commit.view >= self.pacemaker.target_view() {
                let (target, primary) = (commit.view, commit.primary_id);
                self.park_future_view(target, primary, UiMessage::Commit(commit));
            } else {
                debug!("Ignoring Commit for stale view {}", commit.view);
            }
            return;
        }

        let (view, seq) = (commit.view, commit.seq);
        if commit.primary_id != self.pacemaker.current_primary() || commit.replica_id == commit.primary_id {
            self.report_evidence(commit.replica_id, Evidence::InvalidCommit { view, seq }, out);
            return;
        }
        if !self.checkpoints.peer_may_author(commit.replica_id, seq) {
            self.report_evidence(commit.replica_id, Evidence::CheckpointStall { seq }, out);
            return;
        }

        match self.log.check_window(seq) {
            Ok(()) => {}
            Err(LogError::BelowWatermark { .. }) => return,
            Err(_) => {
                self.defer(UiMessage::Commit(commit));
                return;
            }
        }

        match self.log.record_commit(&commit) {
            Ok(()) => self.try_quorum(seq, out),
            Err(LogError::ConflictingCommit { replica_id, view, seq }) => {
                self.report_evidence(replica_id, Evidence::ConflictingCommit { view, seq }, out);
            }
            Err(e) => debug!("Commit {} not recorded: {}", seq, e),
        }
    }

    pub(super) fn defer(&mut self, message: UiMessage) {
        if self.deferred.len() >= self.deferred_limit() {
            warn!(
                "Replica {} dropping {} above the window",
                self.id,
                message.message_type()
            );
            return;
        }
        self.deferred.push(message);
    }

    /// Keep a message for a view that is not installed yet, if it can
    /// belong to a view this replica may still reach
    pub(super) fn park_future_view(&mut self, view: View, primary: ReplicaId, message: UiMessage) {
        let horizon = self.pacemaker.target_view().saturating_add(self.future_view_horizon());
        if view > horizon {
            debug!(
                "Replica {} ignoring {} for view {} beyond {}",
                self.id,
                message.message_type(),
                view,
                horizon
            );
            return;
        }
        if primary != self.config.primary(view) {
            debug!(
                "Replica {} ignoring {} naming {} as primary of view {}",
                self.id,
                message.message_type(),
                primary,
                view
            );
            return;
        }
        if self.future_view.len() >= self.deferred_limit() {
            warn!(
                "Replica {} dropping {} for future view {}",
                self.id,
                message.message_type(),
                view
            );
            return;
        }
        self.future_view.push(message);
    }

    pub(super) fn try_quorum(&mut self, seq: SeqNum, out: &mut Output) {
        if self.log.refresh_quorum(seq) {
            self.execute_ready(out);
        }
    }

    /// Execute every committed slot that is next in sequence
    pub(super) fn execute_ready(&mut self, out: &mut Output) {
        let mut progressed = false;
        while !self.halted {
            let Some((seq, request)) = self
                .log
                .next_executable()
                .and_then(|slot| slot.request().map(|r| (slot.seq, r.clone())))
            else {
                break;
            };

            let result = match self.ordering.execute(&request, self.consumer.as_mut()) {
                Execution::Delivered { result } => {
                    self.reply_to(&request, result.clone(), out);
                    out.event(ReplicaEvent::RequestExecuted {
                        seq,
                        client_id: request.client_id,
                        timestamp: request.timestamp,
                    });
                    result
                }
                Execution::Duplicate { reply } => {
                    if let Some(reply) = reply {
                        out.reply(reply);
                    }
                    Vec::new()
                }
                Execution::Null => Vec::new(),
            };
            if let Err(e) = self.log.mark_executed(seq, result) {
                error!("Replica {} failed to mark {} executed: {}", self.id, seq, e);
                break;
            }
            progressed = true;

            if self.checkpoints.is_boundary(seq) {
                self.take_checkpoint(seq, out);
            }
        }

        if progressed {
            self.pacemaker.reset_timeout();
            if self.pacemaker.is_normal() && self.ordering.has_pending() {
                // Progress restarts the window for what is still pending
                out.start_timer(Timeout::Request, self.config.timeout_request);
                self.request_timer_armed = true;
            } else {
                self.refresh_request_timer(out);
            }
        }
    }

    fn reply_to(&mut self, request: &Request, result: Vec<u8>, out: &mut Output) {
        let mut reply = Reply::new(self.id, request, result);
        if let Err(e) = self.authen.sign_reply(&mut reply) {
            error!("Replica {} could not sign reply: {}", self.id, e);
            return;
        }
        self.ordering.cache_reply(reply.clone());
        out.reply(reply);
    }

    /// Send Commits held back by the checkpoint stall rule
    pub(super) fn flush_deferred_commits(&mut self, out: &mut Output) {
        let ready: Vec<SeqNum> = self
            .deferred_commits
            .keys()
            .copied()
            .take_while(|seq| self.checkpoints.may_author(*seq))
            .collect();
        for seq in ready {
            let Some(prepare) = self.deferred_commits.remove(&seq) else {
                continue;
            };
            let current = self.log.slot_at(seq).is_some_and(|slot| {
                slot.state == SlotState::Prepared && slot.prepare.as_ref() == Some(&prepare)
            });
            if current && prepare.view == self.pacemaker.current_view() {
                info!("Replica {} releases held Commit for {}", self.id, seq);
                self.send_commit(&prepare, out);
            }
        }
    }
}
