/// UI Manager
/// 
/// Issues UIs for locally authored messages and tracks, per peer, which
/// counter values have been processed. Messages from a peer are applied
/// strictly in counter order; a counter reused for a different payload is
/// proof of equivocation and the peer is excluded from then on.

use crate::api::AuthenError;
use crate::authen::AuthenDispatcher;
use crate::crypto::{Hash, Ui};
use crate::messages::ReplicaId;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UiError {
    #[error("Invalid UI certificate from replica {replica_id}: {reason}")]
    InvalidCertificate { replica_id: ReplicaId, reason: String },

    #[error("Replica {replica_id} equivocated on counter {counter}")]
    Equivocation { replica_id: ReplicaId, counter: u64 },

    #[error("Replica {0} is flagged as faulty")]
    UntrustedReplica(ReplicaId),

    #[error("USIG failed to issue a UI: {0}")]
    Issue(#[from] AuthenError),

    #[error("USIG counter went backwards: {previous} -> {issued}")]
    CounterRegression { previous: u64, issued: u64 },
}

pub type Result<T> = std::result::Result<T, UiError>;

/// Outcome of offering a verified UI for in-order processing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiAcceptance {
    /// Next in sequence; the message should be applied now
    Accepted,
    /// Already processed with the same payload
    Duplicate,
    /// Ahead of the next expected counter; hold until the gap closes
    Future { expected: u64 },
}

#[derive(Debug, Default)]
struct PeerCounter {
    last: u64,
    seen: BTreeMap<u64, Hash>,
}

pub struct UiManager {
    authen: AuthenDispatcher,
    last_issued: u64,
    peers: HashMap<ReplicaId, PeerCounter>,
    faulty: HashSet<ReplicaId>,
    /// How many processed counters per peer are kept for equivocation checks
    retention: u64,
}

impl UiManager {
    pub fn new(authen: AuthenDispatcher, retention: u64) -> Self {
        Self {
            authen,
            last_issued: 0,
            peers: HashMap::new(),
            faulty: HashSet::new(),
            retention: retention.max(1),
        }
    }

    /// Certify `digest` with the local USIG. Only the replica's mutation
    /// loop holds `&mut self`, which serializes issuance.
    pub fn issue(&mut self, digest: &Hash) -> Result<Ui> {
        let ui = self.authen.issue_ui(digest)?;
        if ui.counter <= self.last_issued {
            error!(
                "USIG counter regression: previous {}, issued {}",
                self.last_issued, ui.counter
            );
            return Err(UiError::CounterRegression {
                previous: self.last_issued,
                issued: ui.counter,
            });
        }
        self.last_issued = ui.counter;
        Ok(ui)
    }

    pub fn last_issued(&self) -> u64 {
        self.last_issued
    }

    /// Certificate check only; does not touch counter state
    pub fn verify(&self, replica_id: ReplicaId, digest: &Hash, ui: &Ui) -> Result<()> {
        if self.faulty.contains(&replica_id) {
            return Err(UiError::UntrustedReplica(replica_id));
        }
        self.authen
            .verify_ui(replica_id, digest, ui)
            .map_err(|e| UiError::InvalidCertificate {
                replica_id,
                reason: e.to_string(),
            })
    }

    /// Offer a verified UI for in-order processing
    pub fn accept(&mut self, replica_id: ReplicaId, digest: &Hash, ui: &Ui) -> Result<UiAcceptance> {
        if self.faulty.contains(&replica_id) {
            return Err(UiError::UntrustedReplica(replica_id));
        }
        let peer = self.peers.entry(replica_id).or_default();

        if ui.counter <= peer.last {
            let conflicting = peer.seen.get(&ui.counter).is_some_and(|seen| seen != digest);
            if conflicting {
                self.flag(replica_id);
                return Err(UiError::Equivocation {
                    replica_id,
                    counter: ui.counter,
                });
            }
            // Same payload, or older than the retention horizon
            return Ok(UiAcceptance::Duplicate);
        }

        if ui.counter > peer.last + 1 {
            return Ok(UiAcceptance::Future {
                expected: peer.last + 1,
            });
        }

        peer.last = ui.counter;
        peer.seen.insert(ui.counter, *digest);
        let horizon = peer.last.saturating_sub(self.retention);
        if peer.seen.first_key_value().is_some_and(|(&c, _)| c <= horizon) {
            peer.seen = peer.seen.split_off(&(horizon + 1));
        }
        Ok(UiAcceptance::Accepted)
    }

    pub fn expected_counter(&self, replica_id: ReplicaId) -> u64 {
        self.peers.get(&replica_id).map_or(1, |p| p.last + 1)
    }

    /// Fast-forward a peer using counters proven by its view-change log.
    /// Entries already processed are cross-checked for equivocation.
    pub fn resync(&mut self, replica_id: ReplicaId, entries: &[(u64, Hash)]) -> Result<()> {
        if self.faulty.contains(&replica_id) {
            return Err(UiError::UntrustedReplica(replica_id));
        }
        let peer = self.peers.entry(replica_id).or_default();
        let mut conflict = None;
        for (counter, digest) in entries {
            match peer.seen.get(counter) {
                Some(seen) if seen != digest => {
                    conflict = Some(*counter);
                    break;
                }
                Some(_) => {}
                None if *counter > peer.last => {
                    peer.seen.insert(*counter, *digest);
                }
                None => {}
            }
        }
        if let Some(counter) = conflict {
            self.flag(replica_id);
            return Err(UiError::Equivocation { replica_id, counter });
        }
        if let Some(max) = entries.iter().map(|(c, _)| *c).max() {
            if max > peer.last {
                debug!("Resynced replica {} counter {} -> {}", replica_id, peer.last, max);
                peer.last = max;
            }
        }
        Ok(())
    }

    /// Exclude `replica_id` from all further decisions
    pub fn flag(&mut self, replica_id: ReplicaId) {
        if self.faulty.insert(replica_id) {
            error!("Replica {} flagged as Byzantine", replica_id);
        }
    }

    pub fn is_faulty(&self, replica_id: ReplicaId) -> bool {
        self.faulty.contains(&replica_id)
    }

    pub fn faulty_replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.faulty.iter()
    }
}
