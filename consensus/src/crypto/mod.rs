/// Cryptography for the MinBFT core
/// 
/// Implements:
/// - Message digests (BLAKE3)
/// - ECDSA signatures for replica and client roles
/// - USIG counters and UI certificates

pub mod ecdsa;
pub mod hash;
pub mod usig;

pub use ecdsa::{ECDSAError, ECDSAPublicKey, ECDSASecretKey};
pub use hash::{hash_data, Hash};
pub use usig::{verify_ui, SoftUsig, Ui, Usig, UsigError};
