/// Stateless message verification
///
/// Runs in the per-stream worker tasks, off the replica's mutation loop.
/// Only messages that pass every signature, UI certificate and structural
/// check become `VerifiedMessage`s, the sole input type the core accepts.

use crate::api::AuthenError;
use crate::authen::AuthenDispatcher;
use crate::config::ReplicaConfig;
use crate::messages::{Message, MessageError, MessageWithUi, ReplicaId};
use crate::view_change::{ViewChangeError, ViewChangeValidator};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Decode(#[from] MessageError),

    #[error("Authentication failed: {0}")]
    Authen(#[from] AuthenError),

    #[error("Invalid view-change message: {0}")]
    ViewChange(#[from] ViewChangeError),

    #[error("Replica {0} is not a member of the cluster")]
    UnknownReplica(ReplicaId),

    #[error("Replicas do not accept {0} messages")]
    Unexpected(&'static str),
}

pub type Result<T> = std::result::Result<T, VerifyError>;

/// A message whose authenticity has been established
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedMessage(Message);

impl VerifiedMessage {
    pub fn message(&self) -> &Message {
        &self.0
    }

    pub fn into_inner(self) -> Message {
        self.0
    }
}

#[derive(Clone)]
pub struct Verifier {
    config: ReplicaConfig,
    authen: AuthenDispatcher,
}

impl Verifier {
    pub fn new(config: ReplicaConfig, authen: AuthenDispatcher) -> Self {
        Self { config, authen }
    }

    pub fn decode_and_verify(&self, bytes: &[u8]) -> Result<VerifiedMessage> {
        self.verify(Message::from_bytes(bytes)?)
    }

    pub fn verify(&self, message: Message) -> Result<VerifiedMessage> {
        match &message {
            Message::Request(request) => {
                if request.is_null() {
                    return Err(VerifyError::Unexpected("null request"));
                }
                self.authen.verify_request(request)?;
            }
            Message::Reply(_) => return Err(VerifyError::Unexpected("reply")),
            Message::Prepare(prepare) => {
                self.check_member(prepare.replica_id)?;
                self.authen.verify_message_ui(prepare)?;
                self.authen.verify_request(&prepare.request)?;
            }
            Message::Commit(commit) => {
                self.check_member(commit.replica_id)?;
                self.check_member(commit.primary_id)?;
                self.authen.verify_message_ui(commit)?;
                self.authen.verify_message_ui(&commit.prepare())?;
                self.authen.verify_request(&commit.request)?;
            }
            Message::Checkpoint(checkpoint) => {
                self.check_member(checkpoint.replica_id)?;
                self.authen.verify_message_ui(checkpoint)?;
            }
            Message::ViewChange(vc) => {
                self.check_member(vc.replica_id)?;
                self.authen.verify_message_ui(vc)?;
                self.validator().validate_view_change(vc)?;
                self.verify_logged_requests(vc)?;
            }
            Message::NewView(nv) => {
                self.check_member(nv.replica_id)?;
                self.authen.verify_message_ui(nv)?;
                self.validator().validate_new_view(nv)?;
                for vc in &nv.view_changes {
                    self.check_member(vc.replica_id)?;
                    self.verify_logged_requests(vc)?;
                }
            }
        }
        Ok(VerifiedMessage(message))
    }

    fn validator(&self) -> ViewChangeValidator<'_> {
        ViewChangeValidator::new(&self.config, &self.authen)
    }

    fn check_member(&self, replica_id: ReplicaId) -> Result<()> {
        if replica_id >= self.config.n {
            return Err(VerifyError::UnknownReplica(replica_id));
        }
        Ok(())
    }

    /// Requests a new primary may re-propose must carry client signatures
    fn verify_logged_requests(&self, vc: &crate::messages::ViewChange) -> Result<()> {
        for prepare in vc.log.iter().filter_map(|entry| entry.proposal()) {
            self.authen.verify_request(&prepare.request)?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl VerifiedMessage {
    /// Bypass verification for tests that feed the core directly
    pub(crate) fn assume_verified(message: Message) -> Self {
        Self(message)
    }
}
