/// Per-sequence-number ledger entry

use crate::crypto::Hash;
use crate::messages::{Commit, Prepare, ReplicaId, Request, SeqNum, View};
use std::collections::BTreeMap;

/// Lifecycle of a slot. Ordered: a slot only moves forward within a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotState {
    Empty,
    Prepared,
    CommittedLocally,
    QuorumCommitted,
    Executed,
}

#[derive(Clone, Debug)]
pub struct Slot {
    pub seq: SeqNum,
    pub state: SlotState,
    /// Prepare of the latest view this slot was proposed in
    pub prepare: Option<Prepare>,
    /// Latest Commit per replica; a newer view overwrites
    pub commits: BTreeMap<ReplicaId, Commit>,
    pub result: Option<Vec<u8>>,
    /// Prepares from earlier views, kept as evidence until truncation
    pub superseded: Vec<Prepare>,
    pub abandoned: bool,
}

impl Slot {
    pub fn new(seq: SeqNum) -> Self {
        Self {
            seq,
            state: SlotState::Empty,
            prepare: None,
            commits: BTreeMap::new(),
            result: None,
            superseded: Vec::new(),
            abandoned: false,
        }
    }

    pub fn view(&self) -> Option<View> {
        self.prepare.as_ref().map(|p| p.view)
    }

    pub fn request(&self) -> Option<&Request> {
        self.prepare.as_ref().map(|p| &p.request)
    }

    pub fn request_digest(&self) -> Option<Hash> {
        self.request().map(Request::digest)
    }

    /// At least QuorumCommitted: the request at this slot is final
    pub fn is_committed(&self) -> bool {
        self.state >= SlotState::QuorumCommitted
    }

    pub fn is_executed(&self) -> bool {
        self.state == SlotState::Executed
    }

    /// Whether `commit` endorses this slot's current Prepare
    pub fn matches(&self, commit: &Commit) -> bool {
        match &self.prepare {
            Some(prepare) => {
                commit.view == prepare.view
                    && commit.primary_id == prepare.replica_id
                    && commit.primary_ui == prepare.ui
                    && commit.request == prepare.request
            }
            None => false,
        }
    }

    /// Distinct endorsements of the current Prepare, the primary included
    pub fn endorsements(&self) -> usize {
        let Some(prepare) = &self.prepare else {
            return 0;
        };
        1 + self
            .commits
            .values()
            .filter(|c| c.replica_id != prepare.replica_id && self.matches(c))
            .count()
    }
}
