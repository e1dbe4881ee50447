//! Tipline Cryptographic Primitives
//!
//! Cryptographic building blocks for the Tipline messaging substrate. Pure
//! functions with deterministic outputs. Callers provide random bytes for
//! deterministic testing.
//!
//! # Envelope Construction
//!
//! Each message is protected by a hybrid sealed box: an asymmetric key
//! exchange wraps a one-time symmetric key, and an AEAD cipher protects the
//! payload under that key.
//!
//! ```text
//! Ephemeral X25519 Secret (one per message)
//!        │ Diffie-Hellman with recipient public key
//!        ▼
//! HKDF-SHA256 → Content Key (32 bytes, one-time)
//!        │
//!        ▼
//! XChaCha20-Poly1305 → Ciphertext + tag
//! ```
//!
//! The ephemeral secret and derived content key exist for exactly one seal
//! operation and are zeroized afterwards, so compromising one message's key
//! exposes no other message.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Fresh ephemeral X25519 secret per envelope, never reused
//! - Content keys are zeroized immediately after single use
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD rejects any tampered ciphertext
//! - Failed authentication tag -> single unified `DecryptionFailed`
//!
//! Key Hygiene:
//! - Identity secrets zeroize on drop and never appear in `Debug` output
//! - Envelopes carry a one-way fingerprint of the recipient key, never the
//!   key itself

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod envelope;

pub use envelope::{
    CryptoError, IdentityKeyPair, KeyFingerprint, PublicKey, SealedEnvelope, ENVELOPE_ALGORITHM,
    NONCE_SIZE, open, seal,
};
