/// Replica Core
///
/// Sans-io MinBFT replica. Owns every piece of mutable protocol state and
/// is driven one input at a time by the engine:
/// - `handle_message` for verified client and replica messages
/// - `handle_timeout` for expired request/view-change timers
/// - `complete_state_transfer` once the application state was replaced
///
/// Each call returns an `Output` describing broadcasts, client replies,
/// timer commands and events. Replica messages are applied strictly in
/// their author's UI counter order; gaps are buffered per peer.

mod checkpointing;
pub mod engine;
pub mod events;
mod normal;
pub mod output;
pub mod verify;
mod view_change;


use crate::api::{Authenticator, RequestConsumer};
use crate::authen::AuthenDispatcher;
use crate::checkpoint::CheckpointManager;
use crate::config::{self, ReplicaConfig};
use crate::crypto::Hash;
use crate::messages::{
    LoggedMessage, Message, MessageWithUi, ReplicaId, SeqNum, UiMessage, View,
};
use crate::ordering::Ordering;
use crate::pacemaker::{Pacemaker, ViewStatus};
use crate::request_log::RequestLog;
use crate::sync::{self, SyncTracker};
use crate::ui::{UiAcceptance, UiError, UiManager};
use crate::view_change::{ViewChangeManager, ViewChangeReason};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

pub use engine::{EngineError, ReplicaEngine, ReplicaHandle};
pub use events::{Evidence, ReplicaEvent};
pub use output::{Output, TimerCommand, TimerKind, Timeout};
pub use verify::{VerifiedMessage, Verifier, VerifyError};

/// Point-in-time summary of a replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub replica_id: ReplicaId,
    pub view: View,
    pub view_status: ViewStatus,
    pub low_watermark: SeqNum,
    pub last_executed: SeqNum,
    pub stable_checkpoint: SeqNum,
    pub pending_requests: usize,
    pub syncing: bool,
    pub halted: bool,
    pub faulty: Vec<ReplicaId>,
}

pub struct ReplicaCore {
    id: ReplicaId,
    config: ReplicaConfig,
    authen: AuthenDispatcher,
    ui: UiManager,
    log: RequestLog,
    ordering: Ordering,
    checkpoints: CheckpointManager,
    pacemaker: Pacemaker,
    view_changes: ViewChangeManager,
    sync: SyncTracker,
    consumer: Box<dyn RequestConsumer>,

    /// Own UI messages since the checkpoint anchor, in counter order
    sent_log: Vec<LoggedMessage>,

    /// Verified messages waiting for earlier counters from their author
    pending_ui: HashMap<ReplicaId, BTreeMap<u64, UiMessage>>,

    /// Prepares/Commits above the window, re-applied after truncation
    deferred: Vec<UiMessage>,

    /// Messages for views not yet installed
    future_view: Vec<UiMessage>,

    /// Prepared slots whose own Commit waits for the local checkpoint
    deferred_commits: BTreeMap<SeqNum, crate::messages::Prepare>,

    request_timer_armed: bool,

    /// Set on a consistency failure; no further ordering happens
    halted: bool,
}

impl ReplicaCore {
    pub fn new(
        id: ReplicaId,
        config: ReplicaConfig,
        authenticator: Arc<dyn Authenticator>,
        consumer: Box<dyn RequestConsumer>,
    ) -> config::Result<Self> {
        config.validate_replica(id)?;
        let authen = AuthenDispatcher::new(authenticator);
        let logsize = config.logsize as u64;

        info!(
            "Replica {} starting: n={}, f={}, checkpoint period {}, logsize {}",
            id, config.n, config.f, config.checkpoint_period, config.logsize
        );

        Ok(Self {
            id,
            ui: UiManager::new(authen.clone(), 4 * logsize),
            log: RequestLog::new(logsize, config.commit_quorum()),
            ordering: Ordering::new(),
            checkpoints: CheckpointManager::new(
                config.checkpoint_period as u64,
                config.checkpoint_quorum(),
                logsize,
            ),
            pacemaker: Pacemaker::new(config.n, config.timeout_view_change, config.max_timeout),
            view_changes: ViewChangeManager::new(&config),
            sync: SyncTracker::new(),
            consumer,
            sent_log: Vec::new(),
            pending_ui: HashMap::new(),
            deferred: Vec::new(),
            future_view: Vec::new(),
            deferred_commits: BTreeMap::new(),
            request_timer_armed: false,
            halted: false,
            authen,
            config,
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Verifier sharing this replica's configuration and credentials
    pub fn verifier(&self) -> Verifier {
        Verifier::new(self.config.clone(), self.authen.clone())
    }

    pub fn request_log(&self) -> &RequestLog {
        &self.log
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn status(&self) -> ReplicaStatus {
        let mut faulty: Vec<ReplicaId> = self.ui.faulty_replicas().copied().collect();
        faulty.sort_unstable();
        ReplicaStatus {
            replica_id: self.id,
            view: self.pacemaker.current_view(),
            view_status: self.pacemaker.status(),
            low_watermark: self.log.low_watermark(),
            last_executed: self.log.last_executed(),
            stable_checkpoint: self.checkpoints.stable_seq(),
            pending_requests: self.ordering.pending_len(),
            syncing: self.sync.is_syncing(),
            halted: self.halted,
            faulty,
        }
    }

    /// Process one verified message
    pub fn handle_message(&mut self, message: VerifiedMessage) -> Output {
        let mut out = Output::default();
        if self.halted {
            return out;
        }
        match message.into_inner() {
            Message::Request(request) => self.on_request(request, &mut out),
            Message::Reply(_) => {}
            other => {
                if let Ok(message) = other.into_ui_message() {
                    self.on_peer_ui_message(message, &mut out);
                }
            }
        }
        out
    }

    /// Process an expired timer
    pub fn handle_timeout(&mut self, timeout: Timeout) -> Output {
        let mut out = Output::default();
        if self.halted {
            return out;
        }
        match timeout {
            Timeout::Request => {
                self.request_timer_armed = false;
                if self.pacemaker.is_normal() && self.ordering.has_pending() {
                    warn!(
                        "Replica {}: request timer expired in view {}",
                        self.id,
                        self.pacemaker.current_view()
                    );
                    let target = self.pacemaker.current_view() + 1;
                    self.start_view_change(target, ViewChangeReason::RequestTimeout, &mut out);
                }
            }
            Timeout::ViewChange(view) => {
                if self.pacemaker.target_view() == view && !self.pacemaker.is_normal() {
                    warn!("Replica {}: view change to {} timed out", self.id, view);
                    self.start_view_change(view + 1, ViewChangeReason::ViewChangeTimeout, &mut out);
                }
            }
        }
        out
    }

    /// Resume after the application state was replaced up to `seq`
    pub fn complete_state_transfer(&mut self, seq: SeqNum) -> sync::Result<Output> {
        let digest = self.consumer.state_digest();
        let target = self.sync.complete(seq, &digest)?;
        let mut out = Output::default();
        info!(
            "Replica {} installed transferred state at {} (target {})",
            self.id, seq, target.seq
        );
        self.log.install_snapshot(seq);
        self.ordering.install_snapshot(seq);
        self.prune_sent_log(self.checkpoints.stable_seq());
        self.reapply_deferred(&mut out);
        self.execute_ready(&mut out);
        self.propose_pending(&mut out);
        self.refresh_request_timer(&mut out);
        Ok(out)
    }

    fn on_peer_ui_message(&mut self, message: UiMessage, out: &mut Output) {
        if message.replica_id() == self.id {
            return;
        }
        // The embedded Prepare sits in the primary's counter sequence
        if let UiMessage::Commit(commit) = &message {
            if commit.primary_id != self.id {
                self.offer(UiMessage::Prepare(commit.prepare()), out);
            }
        }
        self.offer(message, out);
    }

    /// Apply `message` if it is next in its author's counter order,
    /// otherwise buffer or drop it
    fn offer(&mut self, message: UiMessage, out: &mut Output) {
        let author = message.replica_id();
        let counter = message.ui().counter;
        match self.ui.accept(author, &message.ui_digest(), message.ui()) {
            Ok(UiAcceptance::Accepted) => {
                self.apply(message, out);
                self.drain_pending(author, out);
            }
            Ok(UiAcceptance::Duplicate) => {
                trace!("Duplicate {} #{} from replica {}", message.message_type(), counter, author);
            }
            Ok(UiAcceptance::Future { expected }) => {
                if self.resync_from(&message, out) {
                    self.offer(message, out);
                    return;
                }
                debug!(
                    "Buffering {} #{} from replica {} (expecting #{})",
                    message.message_type(),
                    counter,
                    author,
                    expected
                );
                let limit = self.buffer_limit();
                let queue = self.pending_ui.entry(author).or_default();
                if queue.len() >= limit {
                    warn!("Out-of-order buffer for replica {} is full", author);
                    return;
                }
                queue.entry(counter).or_insert(message);
            }
            Err(UiError::Equivocation { counter, .. }) => {
                self.report_evidence(author, Evidence::Equivocation { counter }, out);
            }
            Err(e) => debug!("Dropping {} from replica {}: {}", message.message_type(), author, e),
        }
    }

    /// Close a counter gap with the author's own certified view-change
    /// log. True when `message` is now next in order.
    fn resync_from(&mut self, message: &UiMessage, out: &mut Output) -> bool {
        let author = message.replica_id();
        let (vc, include_vote) = match message {
            UiMessage::ViewChange(vc) => (vc, false),
            UiMessage::NewView(nv) => match nv.view_changes.iter().find(|vc| vc.replica_id == author) {
                Some(vc) => (vc, true),
                None => return false,
            },
            _ => return false,
        };
        let mut entries: Vec<(u64, Hash)> = vc
            .log
            .iter()
            .map(|entry| (entry.counter(), entry.digest()))
            .collect();
        if include_vote {
            entries.push((vc.ui.counter, vc.ui_digest()));
        }
        let floors: Vec<SeqNum> = vc
            .log
            .iter()
            .filter_map(|entry| match entry {
                LoggedMessage::Checkpoint(c) => Some(c.seq),
                _ => None,
            })
            .collect();

        match self.ui.resync(author, &entries) {
            Ok(()) => {}
            Err(UiError::Equivocation { counter, .. }) => {
                self.report_evidence(author, Evidence::Equivocation { counter }, out);
                return false;
            }
            Err(_) => return false,
        }
        for seq in floors {
            self.checkpoints.note_peer_checkpoint(author, seq);
        }
        self.ui.expected_counter(author) == message.ui().counter
    }

    fn drain_pending(&mut self, author: ReplicaId, out: &mut Output) {
        loop {
            let expected = self.ui.expected_counter(author);
            let Some(queue) = self.pending_ui.get_mut(&author) else {
                return;
            };
            let Some(counter) = queue.keys().next().copied() else {
                self.pending_ui.remove(&author);
                return;
            };
            if counter > expected {
                return;
            }
            let Some(message) = queue.remove(&counter) else {
                return;
            };
            // Entries below `expected` were skipped by a resync; accept
            // still cross-checks them for equivocation
            match self.ui.accept(author, &message.ui_digest(), message.ui()) {
                Ok(UiAcceptance::Accepted) => self.apply(message, out),
                Ok(_) => {}
                Err(UiError::Equivocation { counter, .. }) => {
                    self.report_evidence(author, Evidence::Equivocation { counter }, out);
                    self.pending_ui.remove(&author);
                    return;
                }
                Err(_) => {
                    self.pending_ui.remove(&author);
                    return;
                }
            }
        }
    }

    /// Apply a message that is next in its author's counter order
    fn apply(&mut self, message: UiMessage, out: &mut Output) {
        if self.halted {
            return;
        }
        match message {
            UiMessage::Prepare(prepare) => self.apply_prepare(prepare, out),
            UiMessage::Commit(commit) => self.apply_commit(commit, out),
            UiMessage::Checkpoint(checkpoint) => self.apply_checkpoint(checkpoint, out),
            UiMessage::ViewChange(vc) => self.apply_view_change(vc, out),
            UiMessage::NewView(nv) => self.apply_new_view(nv, out),
        }
    }

    /// Certify a message with the local USIG and record it for future
    /// ViewChanges
    fn seal<M>(&mut self, mut message: M) -> Option<M>
    where
        M: MessageWithUi + Clone + Into<UiMessage>,
    {
        match self.ui.issue(&message.ui_digest()) {
            Ok(ui) => {
                message.attach_ui(ui);
                let sealed: UiMessage = message.clone().into();
                self.sent_log.push(sealed.to_logged());
                Some(message)
            }
            Err(e) => {
                error!("Replica {} could not certify a message: {}", self.id, e);
                None
            }
        }
    }

    fn report_evidence(&mut self, replica_id: ReplicaId, evidence: Evidence, out: &mut Output) {
        warn!("Byzantine evidence against replica {}: {}", replica_id, evidence);
        let against_primary = self.pacemaker.is_normal()
            && replica_id == self.pacemaker.current_primary()
            && replica_id != self.id;
        let reason = evidence.to_string();
        out.event(ReplicaEvent::ByzantineEvidence {
            replica_id,
            evidence,
        });
        if against_primary {
            let target = self.pacemaker.current_view() + 1;
            self.start_view_change(target, ViewChangeReason::PrimaryFault(reason), out);
        }
    }

    /// Local state contradicts a quorum: stop ordering for good
    fn consistency_failure(&mut self, seq: SeqNum, detail: String, out: &mut Output) {
        error!("Replica {} consistency failure at {}: {}", self.id, seq, detail);
        self.halted = true;
        out.stop_timer(TimerKind::Request);
        out.stop_timer(TimerKind::ViewChange);
        out.event(ReplicaEvent::ConsistencyFailure { seq, detail });
    }

    /// Per-peer out-of-order buffer bound
    fn buffer_limit(&self) -> usize {
        4 * self.config.logsize as usize
    }

    /// Bound for messages parked above the window
    fn deferred_limit(&self) -> usize {
        2 * self.config.n as usize * self.config.logsize as usize
    }

    /// How far past the target view messages are still kept
    fn future_view_horizon(&self) -> u64 {
        self.config.n as u64
    }
}
