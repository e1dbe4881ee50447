//! Hybrid message encryption and decryption.
//!
//! Thin, stateless layer over the `tipline-crypto` sealed box: each
//! encryption obtains a one-time key from the [`EphemeralKeyBroker`],
//! seals the payload for the recipient's public key, and returns a
//! self-describing [`EncryptedContent`] envelope. Operations are fully
//! parallelizable across messages - nothing here is serialized.
//!
//! ## Failure uniformity
//!
//! Decryption has three failure modes: tampered ciphertext, wrong key,
//! and compromised ephemeral key. All three surface as the single
//! `CoreError::DecryptionFailed`, and the implementation performs the
//! same AEAD work in every case - the compromise check does not
//! short-circuit ahead of it - so neither the error nor its timing leaks
//! which check failed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tipline_crypto::{ENVELOPE_ALGORITHM, IdentityKeyPair, KeyFingerprint, PublicKey, SealedEnvelope};
use zeroize::Zeroize;

use crate::{env::Environment, ephemeral::EphemeralKeyBroker, error::CoreError, store::Store};

/// An encrypted message envelope, safe to persist and transmit.
///
/// Contains no plaintext and no key material. `key_fingerprint` is a
/// one-way hash of the recipient key the content was sealed for; the
/// algorithm identifier is opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedContent {
    /// Message this content belongs to
    pub message_id: u128,
    /// One-time key used for this message (for compromise lookups)
    pub ephemeral_key_id: u128,
    /// Ephemeral X25519 public key from the seal operation
    pub ephemeral_public: [u8; 32],
    /// AEAD nonce, unique per encryption call
    pub iv: [u8; 24],
    /// Ciphertext including the authentication tag
    pub ciphertext: Vec<u8>,
    /// Algorithm identifier (opaque to callers)
    pub algorithm: String,
    /// One-way fingerprint of the recipient key used
    pub key_fingerprint: String,
    /// When the content was sealed (epoch millis)
    pub created_at: u64,
}

impl EncryptedContent {
    fn envelope(&self) -> SealedEnvelope {
        SealedEnvelope {
            ephemeral_public: self.ephemeral_public,
            nonce: self.iv,
            ciphertext: self.ciphertext.clone(),
            key_fingerprint: KeyFingerprint::from_hex(self.key_fingerprint.clone()),
        }
    }
}

/// Stateless hybrid cipher over the ephemeral key broker.
pub struct MessageCipher<E, S> {
    env: E,
    broker: Arc<EphemeralKeyBroker<E, S>>,
}

impl<E, S> MessageCipher<E, S>
where
    E: Environment,
    S: Store,
{
    /// Create a cipher drawing one-time keys from `broker`.
    pub fn new(env: E, broker: Arc<EphemeralKeyBroker<E, S>>) -> Self {
        Self { env, broker }
    }

    /// Encrypt a plaintext for a recipient.
    ///
    /// Issues a fresh one-time key for `message_id`, seals the plaintext
    /// under a freshly randomized nonce, and wraps everything in an
    /// [`EncryptedContent`]. Two calls with identical plaintext and
    /// recipient produce different nonces and ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KeyReuseViolation` if a key was already issued
    /// for this message, or `CoreError::KeyGeneration` on entropy failure.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        message_id: u128,
        recipient: &PublicKey,
    ) -> Result<EncryptedContent, CoreError> {
        let ephemeral = self.broker.issue(message_id).await?;
        let nonce: [u8; 24] = self.env.random_array();

        let envelope = tipline_crypto::seal(plaintext, recipient, *ephemeral.material(), nonce)?;

        Ok(EncryptedContent {
            message_id,
            ephemeral_key_id: ephemeral.key_id(),
            ephemeral_public: envelope.ephemeral_public,
            iv: envelope.nonce,
            ciphertext: envelope.ciphertext,
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            key_fingerprint: envelope.key_fingerprint.as_str().to_string(),
            created_at: self.env.now_millis(),
        })
    }

    /// Decrypt content with the recipient's key pair.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DecryptionFailed` on tampering, wrong key, or a
    /// compromised ephemeral key - indistinguishably. The AEAD open runs
    /// unconditionally and its result combines with the compromise flag
    /// without short-circuiting, keeping the failure path uniform in
    /// timing.
    pub async fn decrypt(
        &self,
        content: &EncryptedContent,
        recipient: &IdentityKeyPair,
    ) -> Result<Vec<u8>, CoreError> {
        let compromised = self.broker.is_compromised(content.ephemeral_key_id).await?;
        let outcome = tipline_crypto::open(&content.envelope(), recipient);

        match (outcome, compromised) {
            (Ok(plaintext), false) => Ok(plaintext),
            (Ok(mut plaintext), true) => {
                plaintext.zeroize();
                Err(CoreError::DecryptionFailed)
            },
            (Err(_), _) => Err(CoreError::DecryptionFailed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audit::AuditLog, store::MemoryStore};

    #[derive(Clone)]
    struct TestEnv {
        counter: Arc<std::sync::atomic::AtomicU64>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self { counter: Arc::new(std::sync::atomic::AtomicU64::new(1)) }
        }
    }

    impl Environment for TestEnv {
        fn now_millis(&self) -> u64 {
            1_700_000_000_000
        }

        fn sleep(&self, _d: std::time::Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (n as u8).wrapping_mul(41).wrapping_add(i as u8) | 1;
            }
        }
    }

    fn cipher_and_broker()
    -> (MessageCipher<TestEnv, MemoryStore>, Arc<EphemeralKeyBroker<TestEnv, MemoryStore>>) {
        let env = TestEnv::new();
        let store = MemoryStore::new();
        let audit = Arc::new(AuditLog::new(env.clone(), store.clone()));
        let broker = Arc::new(EphemeralKeyBroker::new(env.clone(), store, audit));
        (MessageCipher::new(env, Arc::clone(&broker)), broker)
    }

    fn recipient(seed: u8) -> IdentityKeyPair {
        let mut entropy = [0u8; 32];
        for (i, byte) in entropy.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(13).wrapping_add(seed) | 1;
        }
        IdentityKeyPair::from_entropy(entropy).unwrap()
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let (cipher, _) = cipher_and_broker();
        let recipient = recipient(1);

        let content = cipher.encrypt(b"hello", 1, recipient.public()).await.unwrap();
        let plaintext = cipher.decrypt(&content, &recipient).await.unwrap();

        assert_eq!(plaintext, b"hello");
    }

    #[tokio::test]
    async fn same_plaintext_produces_different_envelopes() {
        let (cipher, _) = cipher_and_broker();
        let recipient = recipient(1);

        let a = cipher.encrypt(b"hello", 1, recipient.public()).await.unwrap();
        let b = cipher.encrypt(b"hello", 2, recipient.public()).await.unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[tokio::test]
    async fn ciphertext_never_contains_plaintext() {
        let (cipher, _) = cipher_and_broker();
        let recipient = recipient(1);
        let plaintext = b"report contents here";

        let content = cipher.encrypt(plaintext, 1, recipient.public()).await.unwrap();
        assert!(!content.ciphertext.windows(plaintext.len()).any(|w| w == plaintext));
    }

    #[tokio::test]
    async fn wrong_recipient_fails() {
        let (cipher, _) = cipher_and_broker();
        let intended = recipient(1);
        let other = recipient(2);

        let content = cipher.encrypt(b"hello", 1, intended.public()).await.unwrap();
        let result = cipher.decrypt(&content, &other).await;

        assert!(matches!(result, Err(CoreError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn tampered_content_fails() {
        let (cipher, _) = cipher_and_broker();
        let recipient = recipient(1);

        let mut content = cipher.encrypt(b"hello", 1, recipient.public()).await.unwrap();
        content.ciphertext[0] ^= 0xFF;

        let result = cipher.decrypt(&content, &recipient).await;
        assert!(matches!(result, Err(CoreError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn compromised_key_fails_only_its_message() {
        let (cipher, broker) = cipher_and_broker();
        let recipient = recipient(1);

        let compromised = cipher.encrypt(b"first", 1, recipient.public()).await.unwrap();
        let healthy = cipher.encrypt(b"second", 2, recipient.public()).await.unwrap();

        broker.mark_compromised(compromised.ephemeral_key_id).await.unwrap();

        let result = cipher.decrypt(&compromised, &recipient).await;
        assert!(matches!(result, Err(CoreError::DecryptionFailed)));

        // Forward secrecy: the unrelated message still decrypts
        assert_eq!(cipher.decrypt(&healthy, &recipient).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn reused_message_id_is_rejected() {
        let (cipher, _) = cipher_and_broker();
        let recipient = recipient(1);

        cipher.encrypt(b"one", 1, recipient.public()).await.unwrap();
        let result = cipher.encrypt(b"two", 1, recipient.public()).await;

        assert!(matches!(result, Err(CoreError::KeyReuseViolation { .. })));
    }

    #[tokio::test]
    async fn envelope_records_algorithm_and_fingerprint() {
        let (cipher, _) = cipher_and_broker();
        let recipient = recipient(1);

        let content = cipher.encrypt(b"hello", 1, recipient.public()).await.unwrap();
        assert_eq!(content.algorithm, ENVELOPE_ALGORITHM);
        assert_eq!(content.key_fingerprint, recipient.fingerprint().as_str());
    }
}
