/// Concrete protocol messages

use super::{MessageWithSignature, MessageWithUi, ClientMessage, PayloadWriter};
use crate::crypto::{hash_data, Hash, Ui};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ReplicaId = u32;
pub type ClientId = u32;
pub type View = u64;
pub type SeqNum = u64;

pub(crate) const KIND_REQUEST: u8 = 1;
pub(crate) const KIND_REPLY: u8 = 2;
pub(crate) const KIND_PREPARE: u8 = 3;
pub(crate) const KIND_COMMIT: u8 = 4;
pub(crate) const KIND_CHECKPOINT: u8 = 5;
pub(crate) const KIND_VIEW_CHANGE: u8 = 6;
pub(crate) const KIND_NEW_VIEW: u8 = 7;

/// Identifies a logical client request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub client_id: ClientId,
    pub timestamp: u64,
}

/// Client request. Content-addressed by its payload, which excludes the
/// signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub client_id: ClientId,
    pub timestamp: u64,
    pub operation: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Request {
    /// Client id reserved for the no-op used to fill sequence gaps
    pub const NULL_CLIENT: ClientId = ClientId::MAX;

    pub fn new(client_id: ClientId, timestamp: u64, operation: Vec<u8>) -> Self {
        Self {
            client_id,
            timestamp,
            operation,
            signature: Vec::new(),
        }
    }

    /// No-op request. Occupies a sequence number but is never delivered.
    pub fn null() -> Self {
        Self::new(Self::NULL_CLIENT, 0, Vec::new())
    }

    pub fn is_null(&self) -> bool {
        self.client_id == Self::NULL_CLIENT
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            client_id: self.client_id,
            timestamp: self.timestamp,
        }
    }

    pub fn digest(&self) -> Hash {
        hash_data(&MessageWithSignature::payload(self))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Request(null)");
        }
        write!(
            f,
            "Request(client={}, ts={}, op={}B)",
            self.client_id,
            self.timestamp,
            self.operation.len()
        )
    }
}

impl ClientMessage for Request {
    fn client_id(&self) -> ClientId {
        self.client_id
    }
}

impl MessageWithSignature for Request {
    fn payload(&self) -> Vec<u8> {
        PayloadWriter::new(KIND_REQUEST)
            .u32(self.client_id)
            .u64(self.timestamp)
            .bytes(&self.operation)
            .finish()
    }

    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn attach_signature(&mut self, signature: Vec<u8>) {
        self.signature = signature;
    }
}

/// Result of an executed request, signed by the replica
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub replica_id: ReplicaId,
    pub client_id: ClientId,
    pub timestamp: u64,
    pub result: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Reply {
    pub fn new(replica_id: ReplicaId, request: &Request, result: Vec<u8>) -> Self {
        Self {
            replica_id,
            client_id: request.client_id,
            timestamp: request.timestamp,
            result,
            signature: Vec::new(),
        }
    }
}

impl ClientMessage for Reply {
    fn client_id(&self) -> ClientId {
        self.client_id
    }
}

impl MessageWithSignature for Reply {
    fn payload(&self) -> Vec<u8> {
        PayloadWriter::new(KIND_REPLY)
            .u32(self.replica_id)
            .u32(self.client_id)
            .u64(self.timestamp)
            .bytes(&self.result)
            .finish()
    }

    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn attach_signature(&mut self, signature: Vec<u8>) {
        self.signature = signature;
    }
}

/// Primary's ordering proposal: request `request` goes to `seq` in `view`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: View,
    pub replica_id: ReplicaId,
    pub seq: SeqNum,
    pub request: Request,
    pub ui: Ui,
}

impl Prepare {
    pub fn new(view: View, replica_id: ReplicaId, seq: SeqNum, request: Request) -> Self {
        Self {
            view,
            replica_id,
            seq,
            request,
            ui: Ui::default(),
        }
    }
}

impl MessageWithUi for Prepare {
    fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn payload(&self) -> Vec<u8> {
        PayloadWriter::new(KIND_PREPARE)
            .u64(self.view)
            .u32(self.replica_id)
            .u64(self.seq)
            .bytes(&MessageWithSignature::payload(&self.request))
            .bytes(&self.request.signature)
            .finish()
    }

    fn ui(&self) -> &Ui {
        &self.ui
    }

    fn attach_ui(&mut self, ui: Ui) {
        self.ui = ui;
    }
}

/// Backup's endorsement of a Prepare. Embeds the Prepare so it can be
/// verified on its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: View,
    pub replica_id: ReplicaId,
    pub primary_id: ReplicaId,
    pub seq: SeqNum,
    pub request: Request,
    pub primary_ui: Ui,
    pub ui: Ui,
}

impl Commit {
    /// Unsigned Commit by `replica_id` endorsing `prepare`
    pub fn for_prepare(replica_id: ReplicaId, prepare: &Prepare) -> Self {
        Self {
            view: prepare.view,
            replica_id,
            primary_id: prepare.replica_id,
            seq: prepare.seq,
            request: prepare.request.clone(),
            primary_ui: prepare.ui.clone(),
            ui: Ui::default(),
        }
    }

    /// The Prepare this Commit endorses
    pub fn prepare(&self) -> Prepare {
        Prepare {
            view: self.view,
            replica_id: self.primary_id,
            seq: self.seq,
            request: self.request.clone(),
            ui: self.primary_ui.clone(),
        }
    }
}

impl MessageWithUi for Commit {
    fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn payload(&self) -> Vec<u8> {
        PayloadWriter::new(KIND_COMMIT)
            .u32(self.replica_id)
            .bytes(&self.prepare().payload())
            .bytes(&self.primary_ui.to_bytes())
            .finish()
    }

    fn ui(&self) -> &Ui {
        &self.ui
    }

    fn attach_ui(&mut self, ui: Ui) {
        self.ui = ui;
    }
}

/// A replica's application state digest after executing `seq`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub replica_id: ReplicaId,
    pub seq: SeqNum,
    pub state_digest: Vec<u8>,
    pub ui: Ui,
}

impl Checkpoint {
    pub fn new(replica_id: ReplicaId, seq: SeqNum, state_digest: Vec<u8>) -> Self {
        Self {
            replica_id,
            seq,
            state_digest,
            ui: Ui::default(),
        }
    }
}

impl MessageWithUi for Checkpoint {
    fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn payload(&self) -> Vec<u8> {
        PayloadWriter::new(KIND_CHECKPOINT)
            .u32(self.replica_id)
            .u64(self.seq)
            .bytes(&self.state_digest)
            .finish()
    }

    fn ui(&self) -> &Ui {
        &self.ui
    }

    fn attach_ui(&mut self, ui: Ui) {
        self.ui = ui;
    }
}

/// Matching Checkpoints from a quorum of distinct replicas
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCertificate {
    pub seq: SeqNum,
    pub state_digest: Vec<u8>,
    pub checkpoints: Vec<Checkpoint>,
}

impl CheckpointCertificate {
    /// The implicit certificate for the initial state
    pub fn genesis() -> Self {
        Self {
            seq: 0,
            state_digest: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.seq == 0
    }

    fn write_into(&self, writer: PayloadWriter) -> PayloadWriter {
        let mut writer = writer
            .u64(self.seq)
            .bytes(&self.state_digest)
            .u32(self.checkpoints.len() as u32);
        for checkpoint in &self.checkpoints {
            writer = writer
                .bytes(&checkpoint.payload())
                .bytes(&checkpoint.ui.to_bytes());
        }
        writer
    }
}

/// Compact record of a ViewChange or NewView in a view-change log.
/// `digest` is the payload digest the stub's UI was issued over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiStub {
    pub replica_id: ReplicaId,
    pub view: View,
    pub digest: Hash,
    pub ui: Ui,
}

/// A UI message the sender authored, as carried in its ViewChange log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoggedMessage {
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(UiStub),
    NewView(UiStub),
}

impl LoggedMessage {
    pub fn replica_id(&self) -> ReplicaId {
        match self {
            LoggedMessage::Prepare(m) => m.replica_id,
            LoggedMessage::Commit(m) => m.replica_id,
            LoggedMessage::Checkpoint(m) => m.replica_id,
            LoggedMessage::ViewChange(s) | LoggedMessage::NewView(s) => s.replica_id,
        }
    }

    pub fn ui(&self) -> &Ui {
        match self {
            LoggedMessage::Prepare(m) => &m.ui,
            LoggedMessage::Commit(m) => &m.ui,
            LoggedMessage::Checkpoint(m) => &m.ui,
            LoggedMessage::ViewChange(s) | LoggedMessage::NewView(s) => &s.ui,
        }
    }

    pub fn counter(&self) -> u64 {
        self.ui().counter
    }

    /// Digest the entry's UI certifies
    pub fn digest(&self) -> Hash {
        match self {
            LoggedMessage::Prepare(m) => m.ui_digest(),
            LoggedMessage::Commit(m) => m.ui_digest(),
            LoggedMessage::Checkpoint(m) => m.ui_digest(),
            LoggedMessage::ViewChange(s) | LoggedMessage::NewView(s) => s.digest,
        }
    }

    /// The ordering proposal this entry vouches for, if any
    pub fn proposal(&self) -> Option<Prepare> {
        match self {
            LoggedMessage::Prepare(m) => Some(m.clone()),
            LoggedMessage::Commit(m) => Some(m.prepare()),
            _ => None,
        }
    }
}

/// Vote to leave the current view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub replica_id: ReplicaId,
    pub new_view: View,
    /// Sender's latest stable checkpoint; `None` means genesis
    pub checkpoint: Option<CheckpointCertificate>,
    /// Every UI message the sender authored since its checkpoint anchor
    pub log: Vec<LoggedMessage>,
    pub ui: Ui,
}

impl ViewChange {
    pub fn stable_seq(&self) -> SeqNum {
        self.checkpoint.as_ref().map_or(0, |c| c.seq)
    }

    pub fn stub(&self) -> UiStub {
        UiStub {
            replica_id: self.replica_id,
            view: self.new_view,
            digest: self.ui_digest(),
            ui: self.ui.clone(),
        }
    }
}

impl MessageWithUi for ViewChange {
    fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn payload(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new(KIND_VIEW_CHANGE)
            .u32(self.replica_id)
            .u64(self.new_view);
        writer = match &self.checkpoint {
            Some(cert) => cert.write_into(writer.u8(1)),
            None => writer.u8(0),
        };
        writer = writer.u32(self.log.len() as u32);
        for entry in &self.log {
            writer = writer
                .bytes(entry.digest().as_ref())
                .bytes(&entry.ui().to_bytes());
        }
        writer.finish()
    }

    fn ui(&self) -> &Ui {
        &self.ui
    }

    fn attach_ui(&mut self, ui: Ui) {
        self.ui = ui;
    }
}

/// New primary's proof that a quorum moved to `view`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub replica_id: ReplicaId,
    pub view: View,
    pub view_changes: Vec<ViewChange>,
    pub ui: Ui,
}

impl NewView {
    pub fn stub(&self) -> UiStub {
        UiStub {
            replica_id: self.replica_id,
            view: self.view,
            digest: self.ui_digest(),
            ui: self.ui.clone(),
        }
    }
}

impl MessageWithUi for NewView {
    fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn payload(&self) -> Vec<u8> {
        let mut writer = PayloadWriter::new(KIND_NEW_VIEW)
            .u32(self.replica_id)
            .u64(self.view)
            .u32(self.view_changes.len() as u32);
        for vc in &self.view_changes {
            writer = writer
                .u32(vc.replica_id)
                .bytes(vc.ui_digest().as_ref())
                .bytes(&vc.ui.to_bytes());
        }
        writer.finish()
    }

    fn ui(&self) -> &Ui {
        &self.ui
    }

    fn attach_ui(&mut self, ui: Ui) {
        self.ui = ui;
    }
}
