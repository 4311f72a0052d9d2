/// ECDSA signatures for replica and client authentication
/// 
/// Uses the secp256k1 curve. Signatures are fixed 64-byte encodings.

use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature as K256Signature, SigningKey, VerifyingKey,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ECDSAError {
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Invalid key encoding")]
    InvalidKey,
    #[error("Signature verification failed")]
    VerificationFailed,
}

/// ECDSA secret key (secp256k1)
#[derive(Clone)]
pub struct ECDSASecretKey {
    inner: SigningKey,
}

impl ECDSASecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        Self {
            inner: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = SigningKey::from_slice(bytes).map_err(|_| ECDSAError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn public_key(&self) -> ECDSAPublicKey {
        ECDSAPublicKey {
            inner: self.inner.verifying_key().clone(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }

    /// Sign `message`, returning the 64-byte signature encoding
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: K256Signature = self.inner.sign(message);
        signature.to_bytes().to_vec()
    }
}

/// ECDSA public key (secp256k1)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ECDSAPublicKey {
    inner: VerifyingKey,
}

impl ECDSAPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| ECDSAError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_sec1_bytes().to_vec()
    }

    /// Verify a signature produced by [`ECDSASecretKey::sign`]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), ECDSAError> {
        let signature =
            K256Signature::from_slice(signature).map_err(|_| ECDSAError::InvalidSignature)?;
        self.inner
            .verify(message, &signature)
            .map_err(|_| ECDSAError::VerificationFailed)
    }
}
