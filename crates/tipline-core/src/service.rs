//! Public facade over the security core.
//!
//! [`SecureCore`] wires every component together once, by construction -
//! no global singletons, no lazy statics. Callers hold one instance and
//! reach every operation through it; tests build one over a deterministic
//! environment and an in-memory store.
//!
//! ## Control flow
//!
//! A send request is gated by the rate limiter, obtains keys through the
//! key manager and ephemeral broker, is sealed by the cipher, and its
//! outcome lands in the audit log. Anonymous submissions bypass identity
//! entirely (they carry no subject to gate on; transport-level gating is
//! the caller's, via [`SecureCore::check_rate_limit`]). The fraud
//! detector runs separately over audit ranges.

use std::{collections::BTreeMap, sync::Arc};

use tipline_crypto::PublicKey;

use crate::{
    anonymize::{AnonymizationProxy, ReportedLocation},
    audit::{AuditEntry, AuditLog},
    cipher::{EncryptedContent, MessageCipher},
    env::Environment,
    ephemeral::EphemeralKeyBroker,
    error::CoreError,
    fraud::{FraudDetector, FraudSignal},
    keys::{KeyManager, KeyPair},
    ratelimit::{Decision, RateLimitConfig, RateLimiter},
    store::Store,
};

/// Rate-limit action name for message encryption.
const ACTION_ENCRYPT: &str = "encrypt";

/// The security core: one instance per service, passed by handle.
pub struct SecureCore<E, S> {
    env: E,
    keys: KeyManager<E, S>,
    broker: Arc<EphemeralKeyBroker<E, S>>,
    cipher: MessageCipher<E, S>,
    proxy: AnonymizationProxy<E, S>,
    limiter: RateLimiter<E, S>,
    audit: Arc<AuditLog<E, S>>,
    fraud: FraudDetector,
}

impl<E, S> SecureCore<E, S>
where
    E: Environment,
    S: Store,
{
    /// Build a core over the given environment and store with default
    /// limits.
    pub fn new(env: E, store: S) -> Self {
        Self::with_rate_limits(env, store, RateLimitConfig::default())
    }

    /// Build a core with explicit rate limits.
    pub fn with_rate_limits(env: E, store: S, limits: RateLimitConfig) -> Self {
        let audit = Arc::new(AuditLog::new(env.clone(), store.clone()));
        let broker =
            Arc::new(EphemeralKeyBroker::new(env.clone(), store.clone(), Arc::clone(&audit)));

        Self {
            keys: KeyManager::new(env.clone(), store.clone(), Arc::clone(&audit)),
            cipher: MessageCipher::new(env.clone(), Arc::clone(&broker)),
            proxy: AnonymizationProxy::new(env.clone(), store.clone(), Arc::clone(&audit)),
            limiter: RateLimiter::with_config(env.clone(), store, Arc::clone(&audit), limits),
            broker,
            audit,
            fraud: FraudDetector::default(),
            env,
        }
    }

    /// Encrypt a message for a recipient.
    ///
    /// Gated by the rate limiter on `(recipient_id, "encrypt")`. The
    /// recipient's key pair is created on first use. Each call issues a
    /// fresh one-time key and nonce; the envelope is produced exactly
    /// once, before any persistence retry, so a retried store write never
    /// multiplies cryptographic artifacts.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::RateLimited` when gated, or the underlying
    /// key/crypto error otherwise.
    pub async fn encrypt_message(
        &self,
        plaintext: &[u8],
        recipient_id: &str,
    ) -> Result<EncryptedContent, CoreError> {
        let decision = self.limiter.check_and_consume(recipient_id, ACTION_ENCRYPT).await?;
        if !decision.allowed {
            return Err(CoreError::RateLimited {
                retry_after: decision.retry_after.unwrap_or_default(),
            });
        }

        let (_, recipient_key) = self.ensure_recipient_key(recipient_id).await?;
        let message_id = self.env.random_u128();
        self.cipher.encrypt(plaintext, message_id, &recipient_key).await
    }

    /// Decrypt content addressed to `recipient_id`.
    ///
    /// The key is located by the envelope's fingerprint across the
    /// recipient's whole history, so messages sealed before a rotation
    /// still open. Every failed decryption appends one
    /// `decryption_failure` audit entry before surfacing the unified
    /// `DecryptionFailed`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DecryptionFailed` on tampering, wrong key, a
    /// compromised ephemeral key, or an unknown fingerprint -
    /// indistinguishably.
    pub async fn decrypt_message(
        &self,
        content: &EncryptedContent,
        recipient_id: &str,
    ) -> Result<Vec<u8>, CoreError> {
        let result = match self.keys.unsealing_key(recipient_id, &content.key_fingerprint).await {
            Ok(key) => self.cipher.decrypt(content, &key).await,
            // Unknown fingerprint is just another wrong-key failure
            Err(CoreError::KeyNotFound { .. }) => Err(CoreError::DecryptionFailed),
            Err(err) => Err(err),
        };

        if matches!(result, Err(CoreError::DecryptionFailed)) {
            self.audit
                .append(
                    recipient_id,
                    "decryption_failure",
                    [("message_id".to_string(), format!("{:032x}", content.message_id))]
                        .into_iter()
                        .collect(),
                )
                .await?;
        }

        result
    }

    /// Rotate a user's identity keys.
    ///
    /// Idempotent in intent: meant to be invoked by an external scheduler.
    /// The retired key stays available for historical decryption.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KeyGeneration` on entropy failure or
    /// `CoreError::Store` on persistence failure.
    pub async fn rotate_user_keys(&self, user_id: &str) -> Result<KeyPair, CoreError> {
        self.keys.rotate(user_id).await
    }

    /// Submit an anonymous report; returns the unlinkable case ID.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationFailed` for empty input.
    pub async fn submit_anonymous_report(
        &self,
        content: &[u8],
        category: &str,
        location: ReportedLocation,
    ) -> Result<String, CoreError> {
        Ok(self.proxy.submit(content, category, location).await?.case_id)
    }

    /// Check a rate limit without any other side effect.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AuditWriteFailed` if a violation cannot be
    /// recorded.
    pub async fn check_rate_limit(
        &self,
        subject_id: &str,
        action: &str,
    ) -> Result<Decision, CoreError> {
        self.limiter.check_and_consume(subject_id, action).await
    }

    /// Append a caller-defined audit event.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AuditWriteFailed` (fatal) if the entry cannot
    /// be persisted.
    pub async fn append_audit_event(
        &self,
        subject_id: &str,
        event_type: &str,
        data: BTreeMap<String, String>,
    ) -> Result<AuditEntry, CoreError> {
        self.audit.append(subject_id, event_type, data).await
    }

    /// Verify a range of the audit chain.
    ///
    /// # Errors
    ///
    /// Returns the fatal `CoreError::IntegrityViolation` naming the first
    /// diverging entry if the chain fails verification.
    pub async fn verify_audit_chain(&self, from_seq: u64, to_seq: u64) -> Result<(), CoreError> {
        let verification = self.audit.verify_chain(from_seq, to_seq).await?;
        match verification.first_invalid {
            None => Ok(()),
            Some(first_invalid) => Err(CoreError::IntegrityViolation { first_invalid }),
        }
    }

    /// Scan an audit range for fraud patterns.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` if the range cannot be loaded.
    pub async fn scan_for_fraud(
        &self,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<FraudSignal>, CoreError> {
        let entries = self.audit.entries(from_seq, to_seq).await?;
        Ok(self.fraud.scan(&entries))
    }

    /// The ephemeral key broker, for compromise reporting.
    pub fn ephemeral_keys(&self) -> &EphemeralKeyBroker<E, S> {
        &self.broker
    }

    /// The key manager, for direct lifecycle queries.
    pub fn keys(&self) -> &KeyManager<E, S> {
        &self.keys
    }

    /// The anonymization proxy, for response routing and collection.
    pub fn anonymizer(&self) -> &AnonymizationProxy<E, S> {
        &self.proxy
    }

    /// The audit log, for reads and range verification.
    pub fn audit_log(&self) -> &AuditLog<E, S> {
        &self.audit
    }

    /// Active public key material for a recipient, creating their first
    /// key pair on first use.
    async fn ensure_recipient_key(
        &self,
        recipient_id: &str,
    ) -> Result<(u128, PublicKey), CoreError> {
        match self.keys.active_sealing_key(recipient_id).await {
            Ok(found) => Ok(found),
            Err(CoreError::KeyNotFound { .. }) => {
                // First use; a concurrent generate losing the race falls
                // back to the freshly installed key
                match self.keys.generate(recipient_id).await {
                    Ok(_) | Err(CoreError::ValidationFailed { .. }) => {},
                    Err(err) => return Err(err),
                }
                self.keys.active_sealing_key(recipient_id).await
            },
            Err(err) => Err(err),
        }
    }
}
