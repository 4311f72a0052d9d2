/// Key-store authenticator
/// 
/// ECDSA keys for the replica and client roles, plus a software USIG per
/// replica. Every node knows the public keys of all replicas and clients.

use crate::api::{AuthenError, AuthenticationRole, Authenticator};
use crate::crypto::{verify_ui, ECDSAPublicKey, ECDSASecretKey, Hash, SoftUsig, Ui, Usig};
use std::collections::HashMap;
use std::sync::Mutex;

/// Authenticator backed by in-memory key material
pub struct KeyStoreAuthenticator {
    replica_key: Option<ECDSASecretKey>,
    client_key: Option<ECDSASecretKey>,
    usig: Option<Mutex<SoftUsig>>,
    replica_keys: HashMap<u32, ECDSAPublicKey>,
    usig_keys: HashMap<u32, ECDSAPublicKey>,
    client_keys: HashMap<u32, ECDSAPublicKey>,
}

impl KeyStoreAuthenticator {
    fn public_key(&self, role: AuthenticationRole, id: u32) -> Result<&ECDSAPublicKey, AuthenError> {
        let keys = match role {
            AuthenticationRole::Replica => &self.replica_keys,
            AuthenticationRole::Usig => &self.usig_keys,
            AuthenticationRole::Client => &self.client_keys,
        };
        keys.get(&id).ok_or(AuthenError::UnknownId { role, id })
    }
}

impl Authenticator for KeyStoreAuthenticator {
    fn verify_message_authen_tag(
        &self,
        role: AuthenticationRole,
        id: u32,
        msg: &[u8],
        tag: &[u8],
    ) -> Result<(), AuthenError> {
        let key = self.public_key(role, id)?;
        match role {
            AuthenticationRole::Usig => {
                let digest = Hash::from_slice(msg)
                    .map_err(|e| AuthenError::InvalidTag(role, e.to_string()))?;
                let ui = Ui::from_bytes(tag).map_err(|e| AuthenError::InvalidTag(role, e.to_string()))?;
                verify_ui(key, &digest, &ui).map_err(|e| AuthenError::InvalidTag(role, e.to_string()))
            }
            _ => key
                .verify(msg, tag)
                .map_err(|e| AuthenError::InvalidTag(role, e.to_string())),
        }
    }

    fn generate_message_authen_tag(
        &self,
        role: AuthenticationRole,
        msg: &[u8],
    ) -> Result<Vec<u8>, AuthenError> {
        match role {
            AuthenticationRole::Replica => self
                .replica_key
                .as_ref()
                .map(|key| key.sign(msg))
                .ok_or(AuthenError::Unsupported(role)),
            AuthenticationRole::Client => self
                .client_key
                .as_ref()
                .map(|key| key.sign(msg))
                .ok_or(AuthenError::Unsupported(role)),
            AuthenticationRole::Usig => {
                let usig = self.usig.as_ref().ok_or(AuthenError::Unsupported(role))?;
                let digest =
                    Hash::from_slice(msg).map_err(|e| AuthenError::Generation(e.to_string()))?;
                // The counter is a single sequential resource
                let mut usig = usig
                    .lock()
                    .map_err(|_| AuthenError::Generation("USIG lock poisoned".into()))?;
                let ui = usig
                    .create_ui(&digest)
                    .map_err(|e| AuthenError::Generation(e.to_string()))?;
                Ok(ui.to_bytes())
            }
        }
    }
}

/// Key material for a whole cluster and its clients
pub struct ClusterKeys {
    replica: Vec<ECDSASecretKey>,
    usig: Vec<ECDSASecretKey>,
    clients: Vec<ECDSASecretKey>,
}

impl ClusterKeys {
    pub fn generate(replicas: u32, clients: u32) -> Self {
        Self {
            replica: (0..replicas).map(|_| ECDSASecretKey::generate()).collect(),
            usig: (0..replicas).map(|_| ECDSASecretKey::generate()).collect(),
            clients: (0..clients).map(|_| ECDSASecretKey::generate()).collect(),
        }
    }

    fn public_map(keys: &[ECDSASecretKey]) -> HashMap<u32, ECDSAPublicKey> {
        keys.iter()
            .enumerate()
            .map(|(id, key)| (id as u32, key.public_key()))
            .collect()
    }

    fn directory(&self) -> KeyStoreAuthenticator {
        KeyStoreAuthenticator {
            replica_key: None,
            client_key: None,
            usig: None,
            replica_keys: Self::public_map(&self.replica),
            usig_keys: Self::public_map(&self.usig),
            client_keys: Self::public_map(&self.clients),
        }
    }

    /// Authenticator for replica `id`, holding its signing key and USIG
    pub fn replica_authenticator(&self, id: u32) -> KeyStoreAuthenticator {
        let mut authen = self.directory();
        authen.replica_key = self.replica.get(id as usize).cloned();
        authen.usig = self
            .usig
            .get(id as usize)
            .cloned()
            .map(|key| Mutex::new(SoftUsig::new(key)));
        authen
    }

    /// Authenticator for client `id`
    pub fn client_authenticator(&self, id: u32) -> KeyStoreAuthenticator {
        let mut authen = self.directory();
        authen.client_key = self.clients.get(id as usize).cloned();
        authen
    }
}
