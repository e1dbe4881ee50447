//! Hybrid sealed-box envelope encryption.
//!
//! Combines X25519 key exchange with XChaCha20-Poly1305 AEAD. All functions
//! are pure; randomness is supplied by the caller so tests can run
//! deterministically.

mod error;
mod keys;
mod seal;

pub use error::CryptoError;
pub use keys::{IdentityKeyPair, KeyFingerprint, PublicKey, SecretKey};
pub use seal::{ENVELOPE_ALGORITHM, NONCE_SIZE, SealedEnvelope, open, seal};
