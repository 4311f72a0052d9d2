/// Protocol messages and the wire envelope
/// 
/// - `Message`: closed envelope over every message kind, bincode-encoded
/// - Capability traits shared by authentication code
/// - Deterministic payload encoding for signatures and UIs

pub mod types;

use crate::crypto::{hash_data, Hash, Ui};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use types::{
    Checkpoint, CheckpointCertificate, ClientId, Commit, LoggedMessage, NewView, Prepare, Reply,
    ReplicaId, Request, RequestKey, SeqNum, UiStub, View, ViewChange,
};

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// Any message authored by a client
pub trait ClientMessage {
    fn client_id(&self) -> ClientId;
}

/// Any message authenticated by its author's USIG
pub trait MessageWithUi {
    fn replica_id(&self) -> ReplicaId;

    /// Serialized message data, excluding the attached UI
    fn payload(&self) -> Vec<u8>;

    fn ui(&self) -> &Ui;

    fn attach_ui(&mut self, ui: Ui);

    /// Digest the UI certificate is issued over
    fn ui_digest(&self) -> Hash {
        hash_data(&self.payload())
    }
}

/// Any message authenticated by a normal signature
pub trait MessageWithSignature {
    /// Serialized message data, excluding the signature
    fn payload(&self) -> Vec<u8>;

    fn signature(&self) -> &[u8];

    fn attach_signature(&mut self, signature: Vec<u8>);
}

/// Builder for deterministic, length-prefixed payload encodings
pub(crate) struct PayloadWriter(Vec<u8>);

impl PayloadWriter {
    pub(crate) fn new(kind: u8) -> Self {
        Self(vec![kind])
    }

    pub(crate) fn u8(mut self, value: u8) -> Self {
        self.0.push(value);
        self
    }

    pub(crate) fn u32(mut self, value: u32) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u64(mut self, value: u64) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn bytes(mut self, value: &[u8]) -> Self {
        self.0.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.0.extend_from_slice(value);
        self
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// Wire envelope. Every concrete message maps to exactly one variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MessageError::Encode(e.to_string()))
    }

    /// Decode one envelope. An unknown tag fails this message only.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| MessageError::Decode(e.to_string()))
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Reply(_) => "reply",
            Message::Prepare(_) => "prepare",
            Message::Commit(_) => "commit",
            Message::Checkpoint(_) => "checkpoint",
            Message::ViewChange(_) => "view-change",
            Message::NewView(_) => "new-view",
        }
    }

    /// The UI-carrying view of this message, if it has one
    pub fn into_ui_message(self) -> std::result::Result<UiMessage, Message> {
        match self {
            Message::Prepare(m) => Ok(UiMessage::Prepare(m)),
            Message::Commit(m) => Ok(UiMessage::Commit(m)),
            Message::Checkpoint(m) => Ok(UiMessage::Checkpoint(m)),
            Message::ViewChange(m) => Ok(UiMessage::ViewChange(m)),
            Message::NewView(m) => Ok(UiMessage::NewView(m)),
            other => Err(other),
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

impl_from_message!(Request, Reply, Prepare, Commit, Checkpoint, ViewChange, NewView);

/// Replica-to-replica message processed in its author's UI counter order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UiMessage {
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
}

impl UiMessage {
    fn inner(&self) -> &dyn MessageWithUi {
        match self {
            UiMessage::Prepare(m) => m,
            UiMessage::Commit(m) => m,
            UiMessage::Checkpoint(m) => m,
            UiMessage::ViewChange(m) => m,
            UiMessage::NewView(m) => m,
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.inner().replica_id()
    }

    pub fn ui(&self) -> &Ui {
        self.inner().ui()
    }

    pub fn ui_digest(&self) -> Hash {
        self.inner().ui_digest()
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            UiMessage::Prepare(_) => "prepare",
            UiMessage::Commit(_) => "commit",
            UiMessage::Checkpoint(_) => "checkpoint",
            UiMessage::ViewChange(_) => "view-change",
            UiMessage::NewView(_) => "new-view",
        }
    }

    /// Entry recorded in the author's view-change log
    pub fn to_logged(&self) -> LoggedMessage {
        match self {
            UiMessage::Prepare(m) => LoggedMessage::Prepare(m.clone()),
            UiMessage::Commit(m) => LoggedMessage::Commit(m.clone()),
            UiMessage::Checkpoint(m) => LoggedMessage::Checkpoint(m.clone()),
            UiMessage::ViewChange(m) => LoggedMessage::ViewChange(m.stub()),
            UiMessage::NewView(m) => LoggedMessage::NewView(m.stub()),
        }
    }
}

macro_rules! impl_from_ui_message {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for UiMessage {
                fn from(m: $variant) -> Self {
                    UiMessage::$variant(m)
                }
            }
        )*
    };
}

impl_from_ui_message!(Prepare, Commit, Checkpoint, ViewChange, NewView);

impl From<UiMessage> for Message {
    fn from(m: UiMessage) -> Self {
        match m {
            UiMessage::Prepare(m) => Message::Prepare(m),
            UiMessage::Commit(m) => Message::Commit(m),
            UiMessage::Checkpoint(m) => Message::Checkpoint(m),
            UiMessage::ViewChange(m) => Message::ViewChange(m),
            UiMessage::NewView(m) => Message::NewView(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prepare() -> Prepare {
        let mut request = Request::new(1, 7, b"X".to_vec());
        request.attach_signature(vec![9; 64]);
        let mut prepare = Prepare::new(0, 0, 1, request);
        prepare.attach_ui(Ui::new(1, vec![1; 64]));
        prepare
    }

    #[test]
    fn test_envelope_encoding_preserves_variant() {
        let prepare = sample_prepare();
        let commit = Commit::for_prepare(2, &prepare);
        let messages: Vec<Message> = vec![
            prepare.request.clone().into(),
            prepare.clone().into(),
            commit.into(),
            Checkpoint::new(1, 100, vec![3; 32]).into(),
        ];

        for message in messages {
            let bytes = message.to_bytes().unwrap();
            let decoded = Message::from_bytes(&bytes).unwrap();
            assert_eq!(decoded.message_type(), message.message_type());
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_unknown_tag_is_decode_error() {
        // bincode encodes the variant index as a little-endian u32
        let bytes = 42u32.to_le_bytes();
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(MessageError::Decode(_))
        ));
        assert!(Message::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_commit_embeds_prepare() {
        let prepare = sample_prepare();
        let commit = Commit::for_prepare(3, &prepare);

        assert_eq!(commit.prepare(), prepare);
        assert_eq!(commit.primary_id, 0);
        assert_eq!(commit.replica_id, 3);
        assert_eq!(commit.prepare().ui_digest(), prepare.ui_digest());
    }

    #[test]
    fn test_payload_excludes_ui_and_signature() {
        let mut prepare = sample_prepare();
        let before = prepare.payload();
        prepare.attach_ui(Ui::new(99, vec![0; 64]));
        assert_eq!(prepare.payload(), before);

        let mut request = Request::new(1, 1, b"op".to_vec());
        let digest = request.digest();
        request.attach_signature(vec![5; 64]);
        assert_eq!(request.digest(), digest);
    }

    #[test]
    fn test_payload_kinds_never_collide() {
        // A Checkpoint and a Prepare with overlapping numeric fields still
        // produce different digests because of the kind tag.
        let checkpoint = Checkpoint::new(0, 1, Vec::new());
        let prepare = sample_prepare();
        assert_ne!(checkpoint.ui_digest(), prepare.ui_digest());
        assert_ne!(checkpoint.payload()[0], prepare.payload()[0]);
    }

    #[test]
    fn test_commit_payload_binds_primary_ui() {
        let prepare = sample_prepare();
        let commit = Commit::for_prepare(1, &prepare);
        let mut tampered = commit.clone();
        tampered.primary_ui = Ui::new(2, vec![1; 64]);
        assert_ne!(commit.ui_digest(), tampered.ui_digest());
    }

    #[test]
    fn test_null_request() {
        let null = Request::null();
        assert!(null.is_null());
        assert!(!Request::new(0, 1, vec![]).is_null());
        assert_eq!(format!("{:?}", null), "Request(null)");
    }

    #[test]
    fn test_ui_message_conversion() {
        let prepare = sample_prepare();
        let message: Message = prepare.clone().into();
        let ui_message = message.into_ui_message().unwrap();
        assert_eq!(ui_message.replica_id(), 0);
        assert_eq!(ui_message.ui().counter, 1);
        assert_eq!(ui_message.to_logged(), LoggedMessage::Prepare(prepare));

        let request: Message = Request::new(1, 1, vec![]).into();
        assert!(request.into_ui_message().is_err());
    }

    #[test]
    fn test_view_change_stub_digest() {
        let vc = ViewChange {
            replica_id: 2,
            new_view: 1,
            checkpoint: None,
            log: vec![LoggedMessage::Prepare(sample_prepare())],
            ui: Ui::new(2, vec![0; 64]),
        };
        let stub = vc.stub();
        assert_eq!(stub.digest, vc.ui_digest());
        assert_eq!(LoggedMessage::ViewChange(stub).counter(), 2);
        assert_eq!(vc.stable_seq(), 0);
    }
}
