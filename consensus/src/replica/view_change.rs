// View changes
//
// Voting to leave a view, joining views that F+1 replicas already left
// for, and installing a NewView on top of its deterministic plan.

use super::{Output, ReplicaCore, ReplicaEvent, TimerKind, Timeout};
use crate::messages::{LoggedMessage, NewView, UiMessage, View, ViewChange};
use crate::view_change::{plan_new_view, ViewChangeReason};
use tracing::{debug, info, warn};

impl ReplicaCore {
    /// Stop ordering in the current view and vote for `target`
    pub(super) fn start_view_change(&mut self, target: View, reason: ViewChangeReason, out: &mut Output) {
        if self.halted {
            return;
        }
        if let Err(e) = self.pacemaker.begin_view_change(target) {
            debug!("Replica {} not moving to view {}: {}", self.id, target, e);
            return;
        }
        warn!("Replica {} starts view change to {} ({})", self.id, target, reason);

        let abandoned = self.log.abandon_stale(target);
        if !abandoned.is_empty() {
            debug!("Abandoned in-flight slots {:?}", abandoned);
        }
        self.deferred_commits.clear();
        let current = |message: &UiMessage| match message {
            UiMessage::Prepare(p) => p.view >= target,
            UiMessage::Commit(c) => c.view >= target,
            _ => true,
        };
        self.deferred.retain(current);
        self.future_view.retain(current);

        let stable = self.checkpoints.stable();
        let vote = ViewChange {
            replica_id: self.id,
            new_view: target,
            checkpoint: (!stable.is_genesis()).then(|| stable.clone()),
            log: self.sent_log.clone(),
            ui: Default::default(),
        };
        let Some(vote) = self.seal(vote) else {
            return;
        };

        out.broadcast(vote.clone());
        out.event(ReplicaEvent::ViewChangeStarted { view: target, reason });
        out.stop_timer(TimerKind::Request);
        self.request_timer_armed = false;
        out.start_timer(
            Timeout::ViewChange(target),
            self.pacemaker.next_view_change_timeout(),
        );
        self.record_vote(vote, out);
    }

    pub(super) fn apply_view_change(&mut self, vote: ViewChange, out: &mut Output) {
        if vote.new_view <= self.pacemaker.current_view() {
            debug!(
                "Ignoring ViewChange from {} for old view {}",
                vote.replica_id, vote.new_view
            );
            return;
        }
        self.record_vote(vote, out);
    }

    /// Count a vote, join higher views, and as the next primary announce
    /// the new view once a quorum is in
    fn record_vote(&mut self, vote: ViewChange, out: &mut Output) {
        let view = vote.new_view;
        let votes = self.view_changes.record_vote(vote);
        debug!("Replica {} has {} votes for view {}", self.id, votes, view);

        if let Some(join) = self.view_changes.join_target(self.pacemaker.target_view()) {
            self.start_view_change(join, ViewChangeReason::Joined, out);
        }

        if self.config.primary(view) != self.id
            || view <= self.pacemaker.current_view()
            || self.view_changes.new_view_sent(view)
        {
            return;
        }
        let Some(view_changes) = self.view_changes.quorum_for(view) else {
            return;
        };
        if self.pacemaker.target_view() < view {
            // Our own vote must be part of the view we lead
            self.start_view_change(view, ViewChangeReason::Joined, out);
            return;
        }
        if self.pacemaker.target_view() != view {
            return;
        }
        self.send_new_view(view, view_changes, out);
    }

    fn send_new_view(&mut self, view: View, view_changes: Vec<ViewChange>, out: &mut Output) {
        let announcement = NewView {
            replica_id: self.id,
            view,
            view_changes,
            ui: Default::default(),
        };
        let Some(announcement) = self.seal(announcement) else {
            return;
        };
        info!(
            "Replica {} announces view {} with {} votes",
            self.id,
            view,
            announcement.view_changes.len()
        );
        self.view_changes.mark_new_view_sent(view);
        out.broadcast(announcement.clone());
        self.install_new_view(&announcement, out);
    }

    pub(super) fn apply_new_view(&mut self, announcement: NewView, out: &mut Output) {
        let view = announcement.view;
        if view <= self.pacemaker.current_view() || view < self.pacemaker.target_view() {
            debug!("Ignoring NewView for view {}", view);
            return;
        }
        for vote in &announcement.view_changes {
            self.view_changes.record_vote(vote.clone());
        }
        self.install_new_view(&announcement, out);
    }

    fn install_new_view(&mut self, announcement: &NewView, out: &mut Output) {
        let view = announcement.view;
        let plan = plan_new_view(view, &announcement.view_changes, self.config.logsize as u64);

        // A committed request can never be replaced by a later view
        let conflict = self.log.slots().find(|slot| {
            slot.is_committed()
                && slot.seq > plan.base()
                && plan.request_at(slot.seq).map(|r| r.digest()) != slot.request_digest()
        });
        if let Some(slot) = conflict {
            let seq = slot.seq;
            self.consistency_failure(
                seq,
                format!("view {} plan replaces a committed request", view),
                out,
            );
            return;
        }

        if let Err(e) = self.pacemaker.enter_view(view) {
            warn!("Replica {} cannot install view {}: {}", self.id, view, e);
            return;
        }
        let primary = self.pacemaker.current_primary();
        info!(
            "Replica {} installed view {} (primary {}, base {}, {} planned)",
            self.id,
            view,
            primary,
            plan.base(),
            plan.entries.len()
        );
        out.stop_timer(TimerKind::ViewChange);
        out.event(ReplicaEvent::NewViewInstalled { view, primary });

        self.view_changes.garbage_collect(view);
        self.log.abandon_stale(view);
        self.deferred_commits.clear();
        for vote in &announcement.view_changes {
            for entry in &vote.log {
                if let LoggedMessage::Checkpoint(c) = entry {
                    self.checkpoints.note_peer_checkpoint(vote.replica_id, c.seq);
                }
            }
        }
        self.ordering.enter_view(view, plan.base(), &plan.entries);

        if plan.base() > self.checkpoints.stable_seq() {
            match self.checkpoints.adopt(&plan.checkpoint) {
                Ok(true) => {
                    out.event(ReplicaEvent::CheckpointStable { seq: plan.base() });
                    self.advance_watermark(&plan.checkpoint, out);
                }
                Ok(false) => {}
                Err(e) => warn!("Replica {} cannot adopt checkpoint: {}", self.id, e),
            }
        }

        self.propose_pending(out);
        self.refresh_request_timer(out);

        let parked = std::mem::take(&mut self.future_view);
        for message in parked {
            self.apply(message, out);
        }
        self.reapply_deferred(out);
    }
}
