/// Test doubles and a deterministic cluster harness
///
/// - `FakeAuthenticator`: keyed BLAKE3 tags and a forgeable USIG, fast
///   enough for clusters that run hundreds of requests
/// - `CounterApp`: application that records every delivered operation
/// - `Cluster`: N replica cores exchanging messages through one queue,
///   with crash/mute switches and manually fired timers

use crate::api::{AuthenError, AuthenticationRole, Authenticator, RequestConsumer};
use crate::authen::AuthenDispatcher;
use crate::config::ReplicaConfig;
use crate::crypto::{Hash, Ui};
use crate::messages::{ClientId, Message, ReplicaId, Reply, Request};
use crate::replica::{Output, ReplicaCore, ReplicaEvent, TimerCommand, TimerKind, Timeout, Verifier};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn role_tag(role: AuthenticationRole) -> u8 {
    match role {
        AuthenticationRole::Replica => 1,
        AuthenticationRole::Usig => 2,
        AuthenticationRole::Client => 3,
    }
}

fn key_for(role: AuthenticationRole, id: u32) -> [u8; 32] {
    let mut material = vec![role_tag(role)];
    material.extend_from_slice(&id.to_le_bytes());
    blake3::derive_key("minbft fake authenticator v1", &material)
}

fn usig_cert(replica_id: ReplicaId, digest: &[u8], counter: u64) -> Vec<u8> {
    let mut data = digest.to_vec();
    data.extend_from_slice(&counter.to_le_bytes());
    blake3::keyed_hash(&key_for(AuthenticationRole::Usig, replica_id), &data)
        .as_bytes()
        .to_vec()
}

/// Authenticator whose keys are derived from (role, id). Generates tags
/// under its own id for every role.
pub(crate) struct FakeAuthenticator {
    id: u32,
    counter: Mutex<u64>,
}

impl FakeAuthenticator {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            counter: Mutex::new(0),
        }
    }

    /// Last USIG counter handed out
    pub(crate) fn last_counter(&self) -> u64 {
        *self.counter.lock().unwrap()
    }

    /// A valid UI for any counter, as a compromised replica could not
    /// produce but a test may need
    pub(crate) fn forge_ui(replica_id: ReplicaId, digest: &Hash, counter: u64) -> Ui {
        Ui::new(counter, usig_cert(replica_id, digest.as_ref(), counter))
    }
}

impl Authenticator for FakeAuthenticator {
    fn verify_message_authen_tag(
        &self,
        role: AuthenticationRole,
        id: u32,
        msg: &[u8],
        tag: &[u8],
    ) -> Result<(), AuthenError> {
        let valid = match role {
            AuthenticationRole::Usig => {
                let ui = Ui::from_bytes(tag).map_err(|e| AuthenError::InvalidTag(role, e.to_string()))?;
                ui.counter > 0 && ui.cert == usig_cert(id, msg, ui.counter)
            }
            _ => blake3::keyed_hash(&key_for(role, id), msg).as_bytes().as_slice() == tag,
        };
        if valid {
            Ok(())
        } else {
            Err(AuthenError::InvalidTag(role, "tag mismatch".into()))
        }
    }

    fn generate_message_authen_tag(
        &self,
        role: AuthenticationRole,
        msg: &[u8],
    ) -> Result<Vec<u8>, AuthenError> {
        match role {
            AuthenticationRole::Usig => {
                let mut counter = self.counter.lock().unwrap();
                *counter += 1;
                Ok(Ui::new(*counter, usig_cert(self.id, msg, *counter)).to_bytes())
            }
            _ => Ok(blake3::keyed_hash(&key_for(role, self.id), msg)
                .as_bytes()
                .to_vec()),
        }
    }
}

#[derive(Default)]
struct AppState {
    executed: Vec<Vec<u8>>,
    /// Mixed into the digest to simulate a diverging replica
    salt: Vec<u8>,
}

/// Records delivered operations; clones share the same state
#[derive(Clone, Default)]
pub(crate) struct CounterApp {
    state: Arc<Mutex<AppState>>,
}

impl CounterApp {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// An app whose state digest never matches a correct replica's
    pub(crate) fn diverging() -> Self {
        let app = Self::default();
        app.state.lock().unwrap().salt = b"corrupted".to_vec();
        app
    }

    pub(crate) fn executed(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().executed.clone()
    }

    /// Replace the state with `source`'s, as a state transfer would
    pub(crate) fn copy_from(&self, source: &CounterApp) {
        let executed = source.executed();
        self.state.lock().unwrap().executed = executed;
    }
}

impl RequestConsumer for CounterApp {
    fn deliver(&mut self, operation: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(operation.to_vec());
        format!("{}:{}", state.executed.len(), String::from_utf8_lossy(operation)).into_bytes()
    }

    fn state_digest(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let mut hasher = blake3::Hasher::new();
        hasher.update(&state.salt);
        for op in &state.executed {
            hasher.update(&(op.len() as u64).to_le_bytes());
            hasher.update(op);
        }
        hasher.finalize().as_bytes().to_vec()
    }
}

/// A message in flight. `from` is `None` for client requests.
#[derive(Clone, Debug)]
pub(crate) struct Envelope {
    pub from: Option<ReplicaId>,
    pub to: ReplicaId,
    pub message: Message,
}

pub(crate) fn test_config(n: u32, f: u32, checkpoint_period: u32, logsize: u32) -> ReplicaConfig {
    ReplicaConfig {
        n,
        f,
        checkpoint_period,
        logsize,
        timeout_request: Duration::from_millis(500),
        timeout_view_change: Duration::from_secs(1),
        max_timeout: Duration::from_secs(8),
    }
}

pub(crate) struct Cluster {
    pub config: ReplicaConfig,
    pub replicas: Vec<ReplicaCore>,
    pub apps: Vec<CounterApp>,
    pub authenticators: Vec<Arc<FakeAuthenticator>>,
    verifiers: Vec<Verifier>,
    queue: VecDeque<Envelope>,
    crashed: HashSet<ReplicaId>,
    muted: HashSet<ReplicaId>,
    timers: Vec<HashMap<TimerKind, Timeout>>,
    events: Vec<Vec<ReplicaEvent>>,
    replies: Vec<Reply>,
    /// Messages that failed verification at the receiver
    pub rejected: usize,
}

impl Cluster {
    pub(crate) fn new(config: ReplicaConfig) -> Self {
        let apps = (0..config.n).map(|_| CounterApp::new()).collect();
        Self::with_apps(config, apps)
    }

    pub(crate) fn with_apps(config: ReplicaConfig, apps: Vec<CounterApp>) -> Self {
        let n = config.n as usize;
        assert_eq!(apps.len(), n);
        let authenticators: Vec<Arc<FakeAuthenticator>> = (0..config.n)
            .map(|id| Arc::new(FakeAuthenticator::new(id)))
            .collect();
        let replicas: Vec<ReplicaCore> = config
            .replicas()
            .map(|id| {
                ReplicaCore::new(
                    id,
                    config.clone(),
                    authenticators[id as usize].clone(),
                    Box::new(apps[id as usize].clone()),
                )
                .unwrap()
            })
            .collect();
        let verifiers = replicas.iter().map(|r| r.verifier()).collect();
        Self {
            config,
            replicas,
            apps,
            authenticators,
            verifiers,
            queue: VecDeque::new(),
            crashed: HashSet::new(),
            muted: HashSet::new(),
            timers: vec![HashMap::new(); n],
            events: vec![Vec::new(); n],
            replies: Vec::new(),
            rejected: 0,
        }
    }

    /// A request signed by `client_id`
    pub(crate) fn request(client_id: ClientId, timestamp: u64, operation: &[u8]) -> Request {
        let mut request = Request::new(client_id, timestamp, operation.to_vec());
        AuthenDispatcher::new(Arc::new(FakeAuthenticator::new(client_id)))
            .sign_request(&mut request)
            .unwrap();
        request
    }

    /// Queue a client request for every replica
    pub(crate) fn submit(&mut self, client_id: ClientId, timestamp: u64, operation: &[u8]) -> Request {
        let request = Self::request(client_id, timestamp, operation);
        for to in self.config.replicas() {
            self.queue.push_back(Envelope {
                from: None,
                to,
                message: Message::Request(request.clone()),
            });
        }
        request
    }

    /// Submit and run until quiet
    pub(crate) fn execute(&mut self, client_id: ClientId, timestamp: u64, operation: &[u8]) {
        self.submit(client_id, timestamp, operation);
        self.run();
    }

    /// Verify and hand `message` to replica `to`, as if from the network
    pub(crate) fn deliver(&mut self, to: ReplicaId, message: Message) {
        if self.crashed.contains(&to) {
            return;
        }
        let bytes = message.to_bytes().unwrap();
        let verified = match self.verifiers[to as usize].decode_and_verify(&bytes) {
            Ok(verified) => verified,
            Err(_) => {
                self.rejected += 1;
                return;
            }
        };
        let out = self.replicas[to as usize].handle_message(verified);
        self.route(to, out);
    }

    fn route(&mut self, from: ReplicaId, out: Output) {
        let silent = self.crashed.contains(&from) || self.muted.contains(&from);
        if !silent {
            for message in out.broadcasts {
                for to in self.config.replicas().filter(|&to| to != from) {
                    self.queue.push_back(Envelope {
                        from: Some(from),
                        to,
                        message: message.clone(),
                    });
                }
            }
        }
        self.replies.extend(out.replies);
        let timers = &mut self.timers[from as usize];
        for command in out.timers {
            match command {
                TimerCommand::Start { timeout, .. } => {
                    timers.insert(timeout.kind(), timeout);
                }
                TimerCommand::Stop(kind) => {
                    timers.remove(&kind);
                }
            }
        }
        self.events[from as usize].extend(out.events);
    }

    /// Deliver the oldest queued message. False when the queue is empty.
    pub(crate) fn step(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(envelope) => {
                self.deliver_envelope(envelope);
                true
            }
            None => false,
        }
    }

    fn deliver_envelope(&mut self, envelope: Envelope) {
        if envelope.from.is_some_and(|from| self.crashed.contains(&from)) {
            return;
        }
        self.deliver(envelope.to, envelope.message);
    }

    /// Deliver in FIFO order until nothing is in flight
    pub(crate) fn run(&mut self) {
        let mut steps = 0;
        while self.step() {
            steps += 1;
            assert!(steps < 1_000_000, "cluster did not quiesce");
        }
    }

    /// Deliver in a random order drawn from `seed` until nothing is in flight
    pub(crate) fn run_shuffled(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut steps = 0;
        while !self.queue.is_empty() {
            let index = rng.gen_range(0..self.queue.len());
            if let Some(envelope) = self.queue.swap_remove_back(index) {
                self.deliver_envelope(envelope);
            }
            steps += 1;
            assert!(steps < 1_000_000, "cluster did not quiesce");
        }
    }

    /// Keep only the queued messages `keep` accepts
    pub(crate) fn retain_queue(&mut self, keep: impl FnMut(&Envelope) -> bool) {
        self.queue.retain(keep);
    }

    pub(crate) fn queued(&self) -> impl Iterator<Item = &Envelope> {
        self.queue.iter()
    }

    /// Drop everything sent to or by `replica`
    pub(crate) fn crash(&mut self, replica: ReplicaId) {
        self.crashed.insert(replica);
    }

    pub(crate) fn recover(&mut self, replica: ReplicaId) {
        self.crashed.remove(&replica);
    }

    /// Drop everything `replica` broadcasts; it still receives
    pub(crate) fn mute(&mut self, replica: ReplicaId) {
        self.muted.insert(replica);
    }

    pub(crate) fn unmute(&mut self, replica: ReplicaId) {
        self.muted.remove(&replica);
    }

    pub(crate) fn is_armed(&self, replica: ReplicaId, kind: TimerKind) -> bool {
        self.timers[replica as usize].contains_key(&kind)
    }

    /// Expire `replica`'s timer of `kind` if it is armed
    pub(crate) fn fire(&mut self, replica: ReplicaId, kind: TimerKind) -> bool {
        if self.crashed.contains(&replica) {
            return false;
        }
        let Some(timeout) = self.timers[replica as usize].remove(&kind) else {
            return false;
        };
        let out = self.replicas[replica as usize].handle_timeout(timeout);
        self.route(replica, out);
        true
    }

    /// Expire the timer of `kind` on every running replica
    pub(crate) fn fire_all(&mut self, kind: TimerKind) {
        for replica in self.config.replicas() {
            self.fire(replica, kind);
        }
    }

    /// Feed an output produced outside `deliver` (e.g. a state transfer)
    pub(crate) fn apply_output(&mut self, replica: ReplicaId, out: Output) {
        self.route(replica, out);
    }

    pub(crate) fn replica(&self, id: ReplicaId) -> &ReplicaCore {
        &self.replicas[id as usize]
    }

    pub(crate) fn replica_mut(&mut self, id: ReplicaId) -> &mut ReplicaCore {
        &mut self.replicas[id as usize]
    }

    pub(crate) fn executed(&self, id: ReplicaId) -> Vec<Vec<u8>> {
        self.apps[id as usize].executed()
    }

    pub(crate) fn events(&self, id: ReplicaId) -> &[ReplicaEvent] {
        &self.events[id as usize]
    }

    pub(crate) fn replies_for(&self, client_id: ClientId, timestamp: u64) -> Vec<&Reply> {
        self.replies
            .iter()
            .filter(|r| r.client_id == client_id && r.timestamp == timestamp)
            .collect()
    }

    /// Replica ids that replied to the request, without duplicates
    pub(crate) fn repliers(&self, client_id: ClientId, timestamp: u64) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self
            .replies_for(client_id, timestamp)
            .iter()
            .map(|r| r.replica_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_tags_bind_role_and_id() {
        let a = FakeAuthenticator::new(1);
        let tag = a
            .generate_message_authen_tag(AuthenticationRole::Replica, b"m")
            .unwrap();
        assert!(a
            .verify_message_authen_tag(AuthenticationRole::Replica, 1, b"m", &tag)
            .is_ok());
        assert!(a
            .verify_message_authen_tag(AuthenticationRole::Replica, 2, b"m", &tag)
            .is_err());
        assert!(a
            .verify_message_authen_tag(AuthenticationRole::Client, 1, b"m", &tag)
            .is_err());
    }

    #[test]
    fn test_fake_usig_counts_and_forges() {
        let a = FakeAuthenticator::new(0);
        let digest = crate::crypto::hash_data(b"payload");
        let first = a
            .generate_message_authen_tag(AuthenticationRole::Usig, digest.as_ref())
            .unwrap();
        assert_eq!(Ui::from_bytes(&first).unwrap().counter, 1);
        assert_eq!(a.last_counter(), 1);

        let forged = FakeAuthenticator::forge_ui(0, &digest, 1);
        assert_eq!(forged.to_bytes(), first);
    }

    #[test]
    fn test_counter_app_digest_tracks_history() {
        let mut a = CounterApp::new();
        let mut b = CounterApp::new();
        assert_eq!(a.state_digest(), b.state_digest());

        assert_eq!(a.deliver(b"x"), b"1:x".to_vec());
        assert_ne!(a.state_digest(), b.state_digest());
        b.deliver(b"x");
        assert_eq!(a.state_digest(), b.state_digest());

        assert_ne!(CounterApp::diverging().state_digest(), CounterApp::new().state_digest());
    }

    #[test]
    fn test_cluster_orders_a_request() {
        let mut cluster = Cluster::new(test_config(3, 1, 10, 20));
        cluster.execute(1, 1, b"op");
        for id in 0..3 {
            assert_eq!(cluster.executed(id), vec![b"op".to_vec()]);
        }
        assert_eq!(cluster.repliers(1, 1), vec![0, 1, 2]);
        assert_eq!(cluster.rejected, 0);
    }
}
