/// Authentication dispatcher
/// 
/// Stateless adapter over the `Authenticator` collaborator. Routes each
/// sign/verify call to the right role and converts between message types
/// and raw tags. Cloned freely into verification workers.

pub mod keystore;

use crate::api::{AuthenError, AuthenticationRole, Authenticator};
use crate::crypto::{Hash, Ui};
use crate::messages::{MessageWithSignature, MessageWithUi, ReplicaId, Reply, Request};
use std::sync::Arc;

pub use keystore::{ClusterKeys, KeyStoreAuthenticator};

pub type Result<T> = std::result::Result<T, AuthenError>;

#[derive(Clone)]
pub struct AuthenDispatcher {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthenDispatcher {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }

    pub fn verify(
        &self,
        role: AuthenticationRole,
        id: u32,
        payload: &[u8],
        tag: &[u8],
    ) -> Result<()> {
        self.authenticator
            .verify_message_authen_tag(role, id, payload, tag)
    }

    pub fn sign(&self, role: AuthenticationRole, payload: &[u8]) -> Result<Vec<u8>> {
        self.authenticator.generate_message_authen_tag(role, payload)
    }

    /// Client signature check. The null request carries no signature.
    pub fn verify_request(&self, request: &Request) -> Result<()> {
        if request.is_null() {
            return Ok(());
        }
        self.verify(
            AuthenticationRole::Client,
            request.client_id,
            &request.payload(),
            request.signature(),
        )
    }

    pub fn sign_request(&self, request: &mut Request) -> Result<()> {
        let signature = self.sign(AuthenticationRole::Client, &request.payload())?;
        request.attach_signature(signature);
        Ok(())
    }

    pub fn sign_reply(&self, reply: &mut Reply) -> Result<()> {
        let signature = self.sign(AuthenticationRole::Replica, &reply.payload())?;
        reply.attach_signature(signature);
        Ok(())
    }

    pub fn verify_reply(&self, reply: &Reply) -> Result<()> {
        self.verify(
            AuthenticationRole::Replica,
            reply.replica_id,
            &reply.payload(),
            reply.signature(),
        )
    }

    /// Ask the local USIG for the next UI over `digest`
    pub fn issue_ui(&self, digest: &Hash) -> Result<Ui> {
        let tag = self.sign(AuthenticationRole::Usig, digest.as_ref())?;
        Ui::from_bytes(&tag)
            .map_err(|e| AuthenError::InvalidTag(AuthenticationRole::Usig, e.to_string()))
    }

    pub fn verify_ui(&self, replica_id: ReplicaId, digest: &Hash, ui: &Ui) -> Result<()> {
        self.verify(
            AuthenticationRole::Usig,
            replica_id,
            digest.as_ref(),
            &ui.to_bytes(),
        )
    }

    /// Verify the UI attached to `message` against its author
    pub fn verify_message_ui<M: MessageWithUi + ?Sized>(&self, message: &M) -> Result<()> {
        self.verify_ui(message.replica_id(), &message.ui_digest(), message.ui())
    }
}
