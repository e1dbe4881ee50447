//! Sealed-box construction: X25519 + HKDF-SHA256 + XChaCha20-Poly1305
//!
//! All functions are pure - random bytes must be provided by the caller.
//! This keeps the crate deterministic under test and leaves the entropy
//! source to the environment layer.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use super::{
    error::CryptoError,
    keys::{IdentityKeyPair, KeyFingerprint, PublicKey},
};

/// Size of the XChaCha20 nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// Algorithm identifier recorded alongside every envelope.
///
/// Opaque to callers; exists so stored ciphertext can survive a future
/// algorithm migration.
pub const ENVELOPE_ALGORITHM: &str = "x25519-hkdf-sha256-xchacha20poly1305";

/// Domain separation label for HKDF
const HKDF_INFO: &[u8] = b"tipline-envelope-v1";

/// A sealed message envelope.
///
/// Carries everything the recipient needs to decrypt except their secret
/// key. Contains no plaintext and no key material; the fingerprint is a
/// one-way hash of the recipient key the envelope was sealed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    /// Ephemeral X25519 public key, one per envelope
    pub ephemeral_public: [u8; 32],
    /// The 24-byte XChaCha20 nonce, unique per seal call
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
    /// One-way fingerprint of the recipient public key
    pub key_fingerprint: KeyFingerprint,
}

impl SealedEnvelope {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE)
    }
}

/// Seal a plaintext for a recipient.
///
/// Performs the full hybrid construction: ephemeral X25519 key from
/// `ephemeral_entropy`, Diffie-Hellman with `recipient`, HKDF-SHA256 to a
/// one-time content key, then XChaCha20-Poly1305 under `nonce`.
///
/// # Security
///
/// - `ephemeral_entropy` and `nonce` MUST come from a cryptographically
///   secure RNG in production; never reuse either across seal calls
/// - The derived content key is zeroized before returning
/// - The returned envelope never contains the plaintext as a substring
///
/// # Errors
///
/// Returns `CryptoError::KeyGeneration` if `ephemeral_entropy` is all
/// zeroes (entropy-source failure).
pub fn seal(
    plaintext: &[u8],
    recipient: &PublicKey,
    ephemeral_entropy: [u8; 32],
    nonce: [u8; NONCE_SIZE],
) -> Result<SealedEnvelope, CryptoError> {
    let ephemeral = IdentityKeyPair::from_entropy(ephemeral_entropy)?;
    let ephemeral_public = *ephemeral.public().as_bytes();

    let mut shared = ephemeral.secret().diffie_hellman(recipient);
    let mut content_key = derive_content_key(&shared, &ephemeral_public, recipient);
    shared.zeroize();

    let cipher = XChaCha20Poly1305::new((&content_key).into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    content_key.zeroize();

    Ok(SealedEnvelope {
        ephemeral_public,
        nonce,
        ciphertext,
        key_fingerprint: recipient.fingerprint(),
    })
}

/// Open a sealed envelope with the recipient's key pair.
///
/// # Errors
///
/// Returns `CryptoError::DecryptionFailed` on authentication-tag mismatch
/// or wrong key. The two causes are deliberately indistinguishable: the
/// same Diffie-Hellman and AEAD work runs in both cases, so neither the
/// error nor its timing reveals which check failed.
pub fn open(envelope: &SealedEnvelope, recipient: &IdentityKeyPair) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_public = PublicKey::from_bytes(envelope.ephemeral_public);

    let mut shared = recipient.secret().diffie_hellman(&ephemeral_public);
    let mut content_key =
        derive_content_key(&shared, &envelope.ephemeral_public, recipient.public());
    shared.zeroize();

    let cipher = XChaCha20Poly1305::new((&content_key).into());
    let result = cipher
        .decrypt(XNonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed);
    content_key.zeroize();

    result
}

/// Derive the one-time content key from the shared secret.
///
/// Salted with both public keys so the key binds to this exact
/// (ephemeral, recipient) pair.
fn derive_content_key(
    shared: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient: &PublicKey,
) -> [u8; 32] {
    let mut salt = [0u8; 64];
    salt[0..32].copy_from_slice(ephemeral_public);
    salt[32..64].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    let Ok(()) = hk.expand(HKDF_INFO, &mut key) else {
        unreachable!("HKDF-SHA256 expand cannot fail for 32-byte output");
    };
    key
}
