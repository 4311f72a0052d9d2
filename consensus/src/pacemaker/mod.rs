// Pacemaker for view progression
// 
// Tracks the current view and whether a view change is in progress, and
// computes view-change timeouts with exponential backoff so that correct
// replicas eventually overlap in a view long enough to make progress.

use crate::messages::{ReplicaId, View};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacemakerError {
    #[error("Cannot move to lower view: {target} < {current}")]
    ViewRegression { current: View, target: View },
}

/// Whether the replica is ordering requests or trying to leave a view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewStatus {
    Normal,
    /// Voted to move to `target`; no Prepares are processed until a
    /// NewView for `target` or higher is installed
    ViewChanging { target: View },
}

pub struct Pacemaker {
    /// Current (installed) view
    current_view: View,

    status: ViewStatus,

    /// Base view-change timeout
    base_timeout: Duration,

    /// Cap for the backed-off timeout
    max_timeout: Duration,

    /// Consecutive view changes without an installed NewView
    timeout_count: u32,

    replica_count: u32,
}

impl Pacemaker {
    pub fn new(replica_count: u32, base_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            current_view: 0,
            status: ViewStatus::Normal,
            base_timeout,
            max_timeout: max_timeout.max(base_timeout),
            timeout_count: 0,
            replica_count: replica_count.max(1),
        }
    }

    pub fn current_view(&self) -> View {
        self.current_view
    }

    pub fn status(&self) -> ViewStatus {
        self.status
    }

    pub fn is_normal(&self) -> bool {
        self.status == ViewStatus::Normal
    }

    /// The view this replica is heading to (current view when normal)
    pub fn target_view(&self) -> View {
        match self.status {
            ViewStatus::Normal => self.current_view,
            ViewStatus::ViewChanging { target } => target,
        }
    }

    /// Round-robin primary: `view mod n`
    pub fn primary(&self, view: View) -> ReplicaId {
        (view % self.replica_count as u64) as ReplicaId
    }

    pub fn current_primary(&self) -> ReplicaId {
        self.primary(self.current_view)
    }

    pub fn is_primary(&self, replica_id: ReplicaId) -> bool {
        self.is_normal() && self.current_primary() == replica_id
    }

    /// View-change timeout with exponential backoff
    ///
    /// Formula: min(base_timeout * 2^timeout_count, max_timeout)
    pub fn next_view_change_timeout(&self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.timeout_count);
        self.base_timeout
            .saturating_mul(multiplier)
            .min(self.max_timeout)
    }

    /// Start (or escalate) a view change to `target`. Each call counts as
    /// one more consecutive attempt for backoff purposes.
    pub fn begin_view_change(&mut self, target: View) -> Result<(), PacemakerError> {
        if target <= self.target_view() {
            return Err(PacemakerError::ViewRegression {
                current: self.target_view(),
                target,
            });
        }
        self.status = ViewStatus::ViewChanging { target };
        self.timeout_count = self.timeout_count.saturating_add(1);
        Ok(())
    }

    /// Install `view` after a valid NewView. Never moves backwards.
    pub fn enter_view(&mut self, view: View) -> Result<(), PacemakerError> {
        if view < self.current_view || (view == self.current_view && self.is_normal()) {
            return Err(PacemakerError::ViewRegression {
                current: self.current_view,
                target: view,
            });
        }
        self.current_view = view;
        self.status = ViewStatus::Normal;
        self.reset_timeout();
        Ok(())
    }

    /// Reset backoff after progress
    pub fn reset_timeout(&mut self) {
        self.timeout_count = 0;
    }
}
