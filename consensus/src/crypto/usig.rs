/// Unique Sequential Identifier (USIG) primitives
/// 
/// A USIG binds a strictly increasing counter value to a message digest.
/// `SoftUsig` is a software stand-in for the tamper-proof component: it
/// keeps the counter in process memory and certifies with a dedicated
/// ECDSA key. Real deployments substitute an enclave-backed `Usig`.

use super::ecdsa::{ECDSAError, ECDSAPublicKey, ECDSASecretKey};
use super::hash::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsigError {
    #[error("Malformed UI encoding ({0} bytes)")]
    Malformed(usize),
    #[error("UI counter must be positive")]
    ZeroCounter,
    #[error("Counter exhausted")]
    CounterExhausted,
    #[error("Certificate rejected: {0}")]
    Certificate(#[from] ECDSAError),
}

/// A UI: counter value plus the certificate binding it to a payload digest
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Ui {
    pub counter: u64,
    pub cert: Vec<u8>,
}

impl Ui {
    pub fn new(counter: u64, cert: Vec<u8>) -> Self {
        Self { counter, cert }
    }

    /// Wire form: little-endian counter followed by the certificate
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.cert.len());
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.extend_from_slice(&self.cert);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UsigError> {
        if bytes.len() < 8 {
            return Err(UsigError::Malformed(bytes.len()));
        }
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&bytes[..8]);
        Ok(Self {
            counter: u64::from_le_bytes(counter),
            cert: bytes[8..].to_vec(),
        })
    }
}

impl fmt::Debug for Ui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ui(#{})", self.counter)
    }
}

/// The tamper-proof counter. Single writer: callers must hold `&mut`.
pub trait Usig: Send {
    /// Assign the next counter value to `digest` and certify the pair
    fn create_ui(&mut self, digest: &Hash) -> Result<Ui, UsigError>;

    /// Public identity used by peers to verify certificates
    fn identity(&self) -> Vec<u8>;
}

/// Bytes covered by a UI certificate
fn certified_bytes(digest: &Hash, counter: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + 32 + 8);
    bytes.extend_from_slice(b"USIG");
    bytes.extend_from_slice(digest.as_ref());
    bytes.extend_from_slice(&counter.to_le_bytes());
    bytes
}

/// Software USIG backed by an ECDSA key
pub struct SoftUsig {
    key: ECDSASecretKey,
    counter: u64,
}

impl SoftUsig {
    pub fn new(key: ECDSASecretKey) -> Self {
        Self { key, counter: 0 }
    }

    pub fn generate() -> Self {
        Self::new(ECDSASecretKey::generate())
    }

    pub fn public_key(&self) -> ECDSAPublicKey {
        self.key.public_key()
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Usig for SoftUsig {
    fn create_ui(&mut self, digest: &Hash) -> Result<Ui, UsigError> {
        let next = self.counter.checked_add(1).ok_or(UsigError::CounterExhausted)?;
        let cert = self.key.sign(&certified_bytes(digest, next));
        self.counter = next;
        Ok(Ui::new(next, cert))
    }

    fn identity(&self) -> Vec<u8> {
        self.key.public_key().to_bytes()
    }
}

/// Check that `ui` was issued by the USIG holding `key` for `digest`
pub fn verify_ui(key: &ECDSAPublicKey, digest: &Hash, ui: &Ui) -> Result<(), UsigError> {
    if ui.counter == 0 {
        return Err(UsigError::ZeroCounter);
    }
    key.verify(&certified_bytes(digest, ui.counter), &ui.cert)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_data;

    #[test]
    fn test_counter_strictly_increasing() {
        let mut usig = SoftUsig::generate();
        let first = usig.create_ui(&hash_data(b"a")).unwrap();
        let second = usig.create_ui(&hash_data(b"b")).unwrap();
        let third = usig.create_ui(&hash_data(b"a")).unwrap();

        assert_eq!(first.counter, 1);
        assert_eq!(second.counter, 2);
        // Same digest never reuses a counter
        assert_eq!(third.counter, 3);
    }

    #[test]
    fn test_verify_binds_digest_and_counter() {
        let mut usig = SoftUsig::generate();
        let pk = usig.public_key();
        let digest = hash_data(b"prepare");
        let ui = usig.create_ui(&digest).unwrap();

        assert!(verify_ui(&pk, &digest, &ui).is_ok());
        assert!(verify_ui(&pk, &hash_data(b"other"), &ui).is_err());

        let mut forged = ui.clone();
        forged.counter += 1;
        assert!(verify_ui(&pk, &digest, &forged).is_err());
    }

    #[test]
    fn test_zero_counter_rejected() {
        let usig = SoftUsig::generate();
        let ui = Ui::new(0, vec![0u8; 64]);
        assert_eq!(
            verify_ui(&usig.public_key(), &Hash::ZERO, &ui),
            Err(UsigError::ZeroCounter)
        );
    }

    #[test]
    fn test_ui_wire_form() {
        let ui = Ui::new(42, vec![7u8; 64]);
        let bytes = ui.to_bytes();
        assert_eq!(bytes.len(), 72);
        assert_eq!(Ui::from_bytes(&bytes).unwrap(), ui);
        assert!(matches!(Ui::from_bytes(&[1, 2, 3]), Err(UsigError::Malformed(3))));
    }
}
