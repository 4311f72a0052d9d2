/// View-Change Manager
/// 
/// Collects ViewChange votes, decides when to join a higher view, validates
/// ViewChange/NewView messages, and computes the deterministic new-view
/// plan. A ViewChange carries every UI message its sender authored since
/// its checkpoint anchor, so a vote cannot hide a Prepare or Commit without
/// leaving a gap in the counter sequence.

pub mod types;

use crate::authen::AuthenDispatcher;
use crate::checkpoint::{self, CheckpointError};
use crate::config::ReplicaConfig;
use crate::messages::{
    CheckpointCertificate, LoggedMessage, MessageWithUi, NewView, ReplicaId, Request, SeqNum,
    View, ViewChange,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

pub use types::{NewViewPlan, ViewChangeReason};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewChangeError {
    #[error("View change to view 0 is meaningless")]
    ZeroView,

    #[error("Invalid checkpoint certificate: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Log entry by replica {got} in a ViewChange from {expected}")]
    ForeignEntry { expected: ReplicaId, got: ReplicaId },

    #[error("Log counters not contiguous: expected {expected}, got {got}")]
    LogGap { expected: u64, got: u64 },

    #[error("Log does not start at counter 1 or at a checkpoint covered by the certificate")]
    BadAnchor,

    #[error("Invalid UI on log entry with counter {0}")]
    InvalidEntryUi(u64),

    #[error("Invalid UI on ViewChange from replica {0}")]
    InvalidVoteUi(ReplicaId),

    #[error("NewView for view {view} sent by {got}, primary is {expected}")]
    NotPrimary {
        view: View,
        expected: ReplicaId,
        got: ReplicaId,
    },

    #[error("ViewChange for view {got} inside NewView for view {expected}")]
    ViewMismatch { expected: View, got: View },

    #[error("Replica {0} appears twice")]
    DuplicateVote(ReplicaId),

    #[error("Only {got} ViewChanges, need {need}")]
    InsufficientVotes { got: usize, need: usize },
}

pub type Result<T> = std::result::Result<T, ViewChangeError>;

/// Stateless checks for ViewChange and NewView messages. Safe to run in
/// verification workers.
pub struct ViewChangeValidator<'a> {
    config: &'a ReplicaConfig,
    authen: &'a AuthenDispatcher,
}

impl<'a> ViewChangeValidator<'a> {
    pub fn new(config: &'a ReplicaConfig, authen: &'a AuthenDispatcher) -> Self {
        Self { config, authen }
    }

    /// Validate everything about `vc` except its own UI
    pub fn validate_view_change(&self, vc: &ViewChange) -> Result<()> {
        if vc.new_view == 0 {
            return Err(ViewChangeError::ZeroView);
        }
        let certificate = vc.checkpoint.clone().unwrap_or_else(CheckpointCertificate::genesis);
        checkpoint::verify_certificate(
            &certificate,
            self.config.checkpoint_period as u64,
            self.config.checkpoint_quorum(),
            |c| self.authen.verify_message_ui(c).is_ok(),
        )?;

        match vc.log.first() {
            None if vc.ui.counter != 1 => return Err(ViewChangeError::BadAnchor),
            Some(first) if first.counter() != 1 => match first {
                LoggedMessage::Checkpoint(c) if c.seq <= certificate.seq => {}
                _ => return Err(ViewChangeError::BadAnchor),
            },
            _ => {}
        }

        let mut expected = vc.log.first().map_or(1, LoggedMessage::counter);
        for entry in &vc.log {
            if entry.replica_id() != vc.replica_id {
                return Err(ViewChangeError::ForeignEntry {
                    expected: vc.replica_id,
                    got: entry.replica_id(),
                });
            }
            if entry.counter() != expected {
                return Err(ViewChangeError::LogGap {
                    expected,
                    got: entry.counter(),
                });
            }
            self.verify_entry(vc.replica_id, entry)?;
            expected += 1;
        }
        if vc.ui.counter != expected {
            return Err(ViewChangeError::LogGap {
                expected,
                got: vc.ui.counter,
            });
        }
        Ok(())
    }

    fn verify_entry(&self, author: ReplicaId, entry: &LoggedMessage) -> Result<()> {
        let counter = entry.counter();
        self.authen
            .verify_ui(author, &entry.digest(), entry.ui())
            .map_err(|_| ViewChangeError::InvalidEntryUi(counter))?;
        if let LoggedMessage::Commit(commit) = entry {
            self.authen
                .verify_message_ui(&commit.prepare())
                .map_err(|_| ViewChangeError::InvalidEntryUi(counter))?;
        }
        Ok(())
    }

    /// Validate everything about `nv` except its own UI
    pub fn validate_new_view(&self, nv: &NewView) -> Result<()> {
        let expected = self.config.primary(nv.view);
        if nv.replica_id != expected {
            return Err(ViewChangeError::NotPrimary {
                view: nv.view,
                expected,
                got: nv.replica_id,
            });
        }
        let need = self.config.view_change_quorum();
        if nv.view_changes.len() < need {
            return Err(ViewChangeError::InsufficientVotes {
                got: nv.view_changes.len(),
                need,
            });
        }
        let mut senders = BTreeSet::new();
        for vc in &nv.view_changes {
            if vc.new_view != nv.view {
                return Err(ViewChangeError::ViewMismatch {
                    expected: nv.view,
                    got: vc.new_view,
                });
            }
            if !senders.insert(vc.replica_id) {
                return Err(ViewChangeError::DuplicateVote(vc.replica_id));
            }
            self.authen
                .verify_message_ui(vc)
                .map_err(|_| ViewChangeError::InvalidVoteUi(vc.replica_id))?;
            self.validate_view_change(vc)?;
        }
        Ok(())
    }
}

/// Compute the new-view plan from a quorum of ViewChanges.
///
/// The base is the highest checkpoint certificate among the votes. For each
/// sequence number above it (and inside the window), the proposal reported
/// with the highest view wins; within a view the Prepare with the lowest
/// primary UI counter wins, since correct replicas only ever accept the
/// first one. Gaps are filled with null requests.
pub fn plan_new_view(view: View, view_changes: &[ViewChange], logsize: u64) -> NewViewPlan {
    let checkpoint = view_changes
        .iter()
        .filter_map(|vc| vc.checkpoint.as_ref())
        .max_by_key(|c| c.seq)
        .cloned()
        .unwrap_or_else(CheckpointCertificate::genesis);
    let base = checkpoint.seq;

    let mut chosen: BTreeMap<SeqNum, (View, u64, Request)> = BTreeMap::new();
    for vc in view_changes {
        for prepare in vc.log.iter().filter_map(LoggedMessage::proposal) {
            if prepare.seq <= base || prepare.seq >= base + logsize || prepare.view >= view {
                continue;
            }
            let candidate = (prepare.view, prepare.ui.counter, prepare.request);
            match chosen.get(&prepare.seq) {
                Some((v, counter, _))
                    if *v > candidate.0 || (*v == candidate.0 && *counter <= candidate.1) => {}
                _ => {
                    chosen.insert(prepare.seq, candidate);
                }
            }
        }
    }

    let end = chosen.keys().next_back().copied().unwrap_or(base);
    let entries = ((base + 1)..=end)
        .map(|seq| {
            let request = chosen
                .remove(&seq)
                .map_or_else(Request::null, |(_, _, request)| request);
            (seq, request)
        })
        .collect();

    NewViewPlan {
        view,
        checkpoint,
        entries,
    }
}

/// Vote bookkeeping for view changes
pub struct ViewChangeManager {
    quorum: usize,
    join_threshold: usize,
    votes: BTreeMap<View, BTreeMap<ReplicaId, ViewChange>>,
    /// Highest view each replica has voted for
    max_voted: HashMap<ReplicaId, View>,
    /// Highest view this replica sent a NewView for, as its primary
    new_view_sent: Option<View>,
}

impl ViewChangeManager {
    pub fn new(config: &ReplicaConfig) -> Self {
        Self {
            quorum: config.view_change_quorum(),
            join_threshold: config.join_threshold(),
            votes: BTreeMap::new(),
            max_voted: HashMap::new(),
            new_view_sent: None,
        }
    }

    /// Record a validated vote. Returns the number of votes for its view.
    pub fn record_vote(&mut self, vc: ViewChange) -> usize {
        let view = vc.new_view;
        let voted = self.max_voted.entry(vc.replica_id).or_insert(view);
        *voted = (*voted).max(view);
        let votes = self.votes.entry(view).or_default();
        votes.entry(vc.replica_id).or_insert(vc);
        debug!("{} view-change votes for view {}", votes.len(), view);
        votes.len()
    }

    pub fn vote_count(&self, view: View) -> usize {
        self.votes.get(&view).map_or(0, BTreeMap::len)
    }

    /// The votes for `view`, once a quorum is present
    pub fn quorum_for(&self, view: View) -> Option<Vec<ViewChange>> {
        let votes = self.votes.get(&view)?;
        if votes.len() < self.quorum {
            return None;
        }
        Some(votes.values().cloned().collect())
    }

    /// Smallest view above `current` that at least F+1 replicas have
    /// voted for (or beyond)
    pub fn join_target(&self, current: View) -> Option<View> {
        let mut higher: Vec<View> = self
            .max_voted
            .values()
            .copied()
            .filter(|v| *v > current)
            .collect();
        if higher.len() < self.join_threshold {
            return None;
        }
        higher.sort_unstable_by(|a, b| b.cmp(a));
        higher.get(self.join_threshold - 1).copied()
    }

    pub fn mark_new_view_sent(&mut self, view: View) {
        self.new_view_sent = Some(self.new_view_sent.map_or(view, |v| v.max(view)));
    }

    pub fn new_view_sent(&self, view: View) -> bool {
        self.new_view_sent.is_some_and(|v| v >= view)
    }

    /// Forget votes for views at or below the installed one
    pub fn garbage_collect(&mut self, installed: View) {
        self.votes = self.votes.split_off(&(installed + 1));
    }
}
