/// View-change plan and triggers

use crate::messages::{CheckpointCertificate, Request, SeqNum, View};
use std::fmt;

/// What the new primary must re-propose, computed identically by every
/// replica from the ViewChanges carried in a NewView
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewViewPlan {
    pub view: View,
    /// Highest stable checkpoint among the votes
    pub checkpoint: CheckpointCertificate,
    /// Consecutive `(seq, request)` from `base() + 1`; gaps hold null requests
    pub entries: Vec<(SeqNum, Request)>,
}

impl NewViewPlan {
    pub fn base(&self) -> SeqNum {
        self.checkpoint.seq
    }

    /// Last planned sequence number (the base when nothing is planned)
    pub fn end(&self) -> SeqNum {
        self.base() + self.entries.len() as SeqNum
    }

    pub fn request_at(&self, seq: SeqNum) -> Option<&Request> {
        if seq <= self.base() {
            return None;
        }
        self.entries
            .get((seq - self.base() - 1) as usize)
            .map(|(_, request)| request)
    }
}

/// Why a replica started a view change
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewChangeReason {
    /// A request was not executed within the request timeout
    RequestTimeout,
    /// The previous view change did not complete in time
    ViewChangeTimeout,
    /// F+1 replicas already vote for a higher view
    Joined,
    /// The primary was caught misbehaving
    PrimaryFault(String),
}

impl fmt::Display for ViewChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewChangeReason::RequestTimeout => write!(f, "request timeout"),
            ViewChangeReason::ViewChangeTimeout => write!(f, "view-change timeout"),
            ViewChangeReason::Joined => write!(f, "joined higher view"),
            ViewChangeReason::PrimaryFault(detail) => write!(f, "primary fault: {}", detail),
        }
    }
}
