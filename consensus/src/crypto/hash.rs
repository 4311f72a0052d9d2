/// Message digests
/// 
/// BLAKE3 over the canonical payload bytes. UIs, request identities and
/// new-view plans all bind to these.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const HASH_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Invalid hash size: expected {HASH_SIZE}, got {0}")]
    InvalidSize(usize),
}

/// Digest output (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        if slice.len() != HASH_SIZE {
            return Err(HashError::InvalidSize(slice.len()));
        }
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hash arbitrary data
pub fn hash_data(data: &[u8]) -> Hash {
    Hash::new(*blake3::hash(data).as_bytes())
}
