/// Ordering State Machine
/// 
/// Sequencing rules for the Prepare/Commit exchange that sit outside the
/// Request Log:
/// - the primary assigns consecutive sequence numbers within a view
/// - a backup accepts the primary's Prepares only in consecutive order and,
///   right after a view change, only if they match the new-view plan
/// - client requests are admitted once, executed once, and answered from a
///   reply cache on retransmission

use crate::api::RequestConsumer;
use crate::crypto::Hash;
use crate::messages::{ClientId, Prepare, ReplicaId, Reply, Request, RequestKey, SeqNum, View};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::debug;

/// A Prepare that breaks the sequencing rules. Always Byzantine evidence
/// against the primary that authored it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderingViolation {
    #[error("Prepare from {got} but the primary of view {view} is {expected}")]
    NotPrimary {
        view: View,
        expected: ReplicaId,
        got: ReplicaId,
    },

    #[error("Prepare assigns sequence {got}, expected {expected}")]
    OutOfOrder { expected: SeqNum, got: SeqNum },

    #[error("Prepare for sequence {seq} deviates from the new-view plan")]
    PlanMismatch { seq: SeqNum },
}

/// Outcome of a client request reaching the replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestAdmission {
    /// Already executed; resend this reply
    CachedReply(Reply),
    /// Older than what was executed for this client
    Stale,
    /// Known and not yet executed
    AlreadyPending,
    /// Newly queued
    Accepted,
}

/// Outcome of executing a committed slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Execution {
    Delivered { result: Vec<u8> },
    /// Already executed at an earlier sequence number; not delivered again
    Duplicate { reply: Option<Reply> },
    /// Gap filler
    Null,
}

#[derive(Default)]
pub struct Ordering {
    /// Highest sequence number this replica proposed as primary
    last_assigned: SeqNum,
    /// Highest sequence number accepted from the current primary
    last_prepared: SeqNum,
    /// New-view plan the primary still has to re-propose
    reproposals: VecDeque<(SeqNum, Request)>,
    /// New-view plan the backups check re-proposals against
    expected: BTreeMap<SeqNum, Hash>,
    /// Accepted client requests that have not been executed
    pending: VecDeque<Request>,
    pending_keys: HashSet<RequestKey>,
    /// Requests already bound to a sequence number in this view
    assigned: HashSet<RequestKey>,
    replies: HashMap<ClientId, Reply>,
    executed_ts: HashMap<ClientId, u64>,
}

impl Ordering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_prepared(&self) -> SeqNum {
        self.last_prepared
    }

    pub fn last_assigned(&self) -> SeqNum {
        self.last_assigned
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Admit a client request whose signature has been verified
    pub fn on_client_request(&mut self, request: &Request) -> RequestAdmission {
        if request.is_null() {
            return RequestAdmission::Stale;
        }
        if let Some(&executed) = self.executed_ts.get(&request.client_id) {
            if request.timestamp == executed {
                if let Some(reply) = self.cached_reply(request.client_id) {
                    return RequestAdmission::CachedReply(reply.clone());
                }
            }
            if request.timestamp <= executed {
                return RequestAdmission::Stale;
            }
        }
        let key = request.key();
        if self.pending_keys.contains(&key) {
            return RequestAdmission::AlreadyPending;
        }
        self.pending_keys.insert(key);
        self.pending.push_back(request.clone());
        RequestAdmission::Accepted
    }

    /// Reset per-view sequencing when view `view` is installed on top of
    /// `base`, with `plan` to be re-proposed in order.
    pub fn enter_view(&mut self, view: View, base: SeqNum, plan: &[(SeqNum, Request)]) {
        self.last_assigned = base;
        self.last_prepared = base;
        self.reproposals = plan.iter().cloned().collect();
        self.expected = plan
            .iter()
            .map(|(seq, request)| (*seq, request.digest()))
            .collect();
        self.assigned = plan
            .iter()
            .filter(|(_, r)| !r.is_null())
            .map(|(_, r)| r.key())
            .collect();
        debug!(
            "Ordering entered view {} at base {} with {} re-proposals",
            view,
            base,
            plan.len()
        );
    }

    /// Next `(seq, request)` for the primary to propose, if `seq < limit`
    pub fn take_proposal(&mut self, limit: SeqNum) -> Option<(SeqNum, Request)> {
        let seq = self.last_assigned + 1;
        if seq >= limit {
            return None;
        }
        if let Some((planned, _)) = self.reproposals.front() {
            if *planned == seq {
                let (_, request) = self.reproposals.pop_front()?;
                self.last_assigned = seq;
                return Some((seq, request));
            }
        }
        let request = self
            .pending
            .iter()
            .find(|r| !self.assigned.contains(&r.key()))?
            .clone();
        self.assigned.insert(request.key());
        self.last_assigned = seq;
        Some((seq, request))
    }

    /// Sequencing checks for a Prepare received in the current view
    pub fn check_prepare(
        &self,
        prepare: &Prepare,
        primary: ReplicaId,
    ) -> std::result::Result<(), OrderingViolation> {
        if prepare.replica_id != primary {
            return Err(OrderingViolation::NotPrimary {
                view: prepare.view,
                expected: primary,
                got: prepare.replica_id,
            });
        }
        if prepare.seq != self.last_prepared + 1 {
            return Err(OrderingViolation::OutOfOrder {
                expected: self.last_prepared + 1,
                got: prepare.seq,
            });
        }
        if let Some(digest) = self.expected.get(&prepare.seq) {
            if *digest != prepare.request.digest() {
                return Err(OrderingViolation::PlanMismatch { seq: prepare.seq });
            }
        }
        Ok(())
    }

    pub fn note_prepared(&mut self, prepare: &Prepare) {
        self.last_prepared = self.last_prepared.max(prepare.seq);
        self.expected.remove(&prepare.seq);
        if !prepare.request.is_null() {
            self.assigned.insert(prepare.request.key());
        }
    }

    /// Execute a committed request at most once per client timestamp
    pub fn execute(&mut self, request: &Request, consumer: &mut dyn RequestConsumer) -> Execution {
        if request.is_null() {
            return Execution::Null;
        }
        self.forget_pending(&request.key());
        self.assigned.remove(&request.key());
        if let Some(&executed) = self.executed_ts.get(&request.client_id) {
            if request.timestamp <= executed {
                let reply = self
                    .replies
                    .get(&request.client_id)
                    .filter(|r| r.timestamp == request.timestamp)
                    .cloned();
                return Execution::Duplicate { reply };
            }
        }
        let result = consumer.deliver(&request.operation);
        self.executed_ts.insert(request.client_id, request.timestamp);
        // Requests from this client older than the executed one are obsolete
        let client = request.client_id;
        let timestamp = request.timestamp;
        self.pending
            .retain(|r| r.client_id != client || r.timestamp > timestamp);
        self.pending_keys
            .retain(|k| k.client_id != client || k.timestamp > timestamp);
        self.assigned
            .retain(|k| k.client_id != client || k.timestamp > timestamp);
        Execution::Delivered { result }
    }

    pub fn cache_reply(&mut self, reply: Reply) {
        self.replies.insert(reply.client_id, reply);
    }

    pub fn cached_reply(&self, client_id: ClientId) -> Option<&Reply> {
        self.replies.get(&client_id)
    }

    /// Adopt a transferred state: client progress is unknown, so pending
    /// requests stay queued and will be filtered at execution time.
    pub fn install_snapshot(&mut self, seq: SeqNum) {
        self.last_assigned = self.last_assigned.max(seq);
        self.last_prepared = self.last_prepared.max(seq);
    }

    fn forget_pending(&mut self, key: &RequestKey) {
        if self.pending_keys.remove(key) {
            self.pending.retain(|r| r.key() != *key);
        }
    }
}
