//! Identity key pairs and fingerprints
//!
//! # Security Properties
//!
//! - Secrets zeroize on drop and never appear in `Debug` output
//! - Fingerprints are one-way (SHA-256 of the public bytes)
//! - X25519 curve strength is the stated equivalent of a 3072-bit modulus

use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use super::error::CryptoError;

/// A one-way fingerprint of a public key.
///
/// Safe to log, persist, and embed in envelopes; the key itself cannot be
/// recovered from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyFingerprint(String);

impl KeyFingerprint {
    /// Rebuild a fingerprint from its hex rendering (e.g. one read back
    /// from a persisted envelope).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex rendering of the fingerprint.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An X25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// One-way SHA-256 fingerprint of this key.
    pub fn fingerprint(&self) -> KeyFingerprint {
        let digest = Sha256::digest(self.0);
        KeyFingerprint(hex::encode(digest))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.fingerprint().as_str().to_string()).finish()
    }
}

/// An X25519 secret key.
///
/// Zeroized on drop. `Debug` prints a redaction marker, never key bytes.
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Diffie-Hellman exchange with a peer public key.
    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> [u8; 32] {
        let shared = self.0.diffie_hellman(&X25519Public::from(*peer.as_bytes()));
        shared.to_bytes()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A long-term identity key pair.
///
/// The secret half never leaves this structure except through the
/// Diffie-Hellman operation used internally by [`open`](super::open).
#[derive(Debug)]
pub struct IdentityKeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl IdentityKeyPair {
    /// Build a key pair from 32 caller-provided random bytes.
    ///
    /// The caller MUST source `entropy` from a cryptographically secure RNG
    /// in production. All-zero entropy is rejected as an entropy-source
    /// failure rather than silently producing a weak key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` if `entropy` is all zeroes.
    pub fn from_entropy(mut entropy: [u8; 32]) -> Result<Self, CryptoError> {
        if entropy.iter().all(|b| *b == 0) {
            return Err(CryptoError::KeyGeneration {
                reason: "entropy source returned all-zero bytes".to_string(),
            });
        }

        let secret = StaticSecret::from(entropy);
        entropy.zeroize();

        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Ok(Self { public, secret: SecretKey(secret) })
    }

    /// Rebuild a key pair from stored secret bytes.
    ///
    /// Used when loading a persisted key; the stored bytes were produced by
    /// [`secret_bytes`](Self::secret_bytes).
    pub fn from_secret_bytes(mut bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Self { public, secret: SecretKey(secret) }
    }

    /// The public half of the pair.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The secret half of the pair.
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Raw secret bytes for persistence.
    ///
    /// Only the owning key store should call this; the bytes must be
    /// zeroized by the caller once persisted.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.0.to_bytes()
    }

    /// Fingerprint of the public key.
    pub fn fingerprint(&self) -> KeyFingerprint {
        self.public.fingerprint()
    }
}
