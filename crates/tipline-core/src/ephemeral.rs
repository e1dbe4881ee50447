//! One-time ephemeral key brokerage for forward secrecy.
//!
//! Issues a fresh symmetric key per message, bound one-to-one to that
//! message's ID. Key material is handed out exactly once, used for a
//! single seal operation, and zeroized; only the compromise flag is
//! persisted. Compromising one message's key therefore affects that
//! message alone - every other message was sealed under independent
//! material.
//!
//! Reuse is a logic error: asking for a second key for the same message
//! fails with `KeyReuseViolation` rather than quietly minting another,
//! so one logical send can never leak a multiplicity of artifacts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    audit::AuditLog,
    env::Environment,
    error::CoreError,
    store::{self, Store, StoreError, WriteOp, retry},
};

/// Collection holding ephemeral key records (never the material).
const EPHEMERAL_COLLECTION: &str = "ephemeral";

/// Collection mapping message IDs to their issued key, for reuse checks.
const BY_MESSAGE_COLLECTION: &str = "ephemeral_by_message";

/// A freshly issued one-time key.
///
/// The material lives only in this value; the broker retains nothing but
/// the compromise flag. Zeroized on drop, no material in `Debug` output.
pub struct EphemeralKey {
    key_id: u128,
    message_id: u128,
    created_at: u64,
    material: [u8; 32],
}

impl EphemeralKey {
    /// Unique ID of this key.
    pub fn key_id(&self) -> u128 {
        self.key_id
    }

    /// Message this key was issued for.
    pub fn message_id(&self) -> u128 {
        self.message_id
    }

    /// When the key was issued (epoch millis).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The 32-byte one-time material, for exactly one seal operation.
    pub(crate) fn material(&self) -> &[u8; 32] {
        &self.material
    }
}

impl Drop for EphemeralKey {
    fn drop(&mut self) {
        self.material.zeroize();
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("key_id", &self.key_id)
            .field("message_id", &self.message_id)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// Persisted state of an issued key: identity and compromise flag only.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EphemeralRecord {
    key_id: u128,
    message_id: u128,
    created_at: u64,
    compromised: bool,
}

/// Pointer from a message to the key issued for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessagePointer {
    key_id: u128,
}

/// Issues and tracks one-time keys.
pub struct EphemeralKeyBroker<E, S> {
    env: E,
    store: S,
    audit: Arc<AuditLog<E, S>>,
    retry: retry::RetryPolicy,
}

impl<E, S> EphemeralKeyBroker<E, S>
where
    E: Environment,
    S: Store,
{
    /// Create a broker over the given store and audit log.
    pub fn new(env: E, store: S, audit: Arc<AuditLog<E, S>>) -> Self {
        Self { env, store, audit, retry: retry::RetryPolicy::default() }
    }

    /// Issue a fresh one-time key for a message.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KeyReuseViolation` if a key was already issued
    /// for this message, `CoreError::KeyCompromised` if that earlier key
    /// has since been flagged, or `CoreError::Store` if the record cannot
    /// be persisted after retries.
    pub async fn issue(&self, message_id: u128) -> Result<EphemeralKey, CoreError> {
        match self.store.get(BY_MESSAGE_COLLECTION, &hex_id(message_id)).await {
            Ok(bytes) => {
                // A repeat request for a flagged message surfaces the
                // compromise, not a generic reuse
                let pointer: MessagePointer = store::decode(&bytes)?;
                return if self.is_compromised(pointer.key_id).await? {
                    Err(CoreError::KeyCompromised { key_id: pointer.key_id })
                } else {
                    Err(CoreError::KeyReuseViolation { message_id })
                };
            },
            Err(StoreError::NotFound { .. }) => {},
            Err(err) => return Err(err.into()),
        }

        let key_id = self.env.random_u128();
        let created_at = self.env.now_millis();
        let material: [u8; 32] = self.env.random_array();

        let record = EphemeralRecord { key_id, message_id, created_at, compromised: false };
        let ops = vec![
            WriteOp::Put {
                collection: EPHEMERAL_COLLECTION.to_string(),
                id: hex_id(key_id),
                record: store::encode(&record)?,
            },
            WriteOp::Put {
                collection: BY_MESSAGE_COLLECTION.to_string(),
                id: hex_id(message_id),
                record: store::encode(&MessagePointer { key_id })?,
            },
        ];

        retry::with_backoff(&self.env, self.retry, || {
            let store = self.store.clone();
            let ops = ops.clone();
            async move { store.batch_write(ops).await }
        })
        .await?;

        Ok(EphemeralKey { key_id, message_id, created_at, material })
    }

    /// Mark a key compromised.
    ///
    /// Subsequent decryption attempts for the associated message fail;
    /// every other message is unaffected. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KeyNotFound` if no such key was ever issued.
    pub async fn mark_compromised(&self, key_id: u128) -> Result<(), CoreError> {
        let mut record: EphemeralRecord =
            match self.store.get(EPHEMERAL_COLLECTION, &hex_id(key_id)).await {
                Ok(bytes) => store::decode(&bytes)?,
                Err(StoreError::NotFound { .. }) => {
                    return Err(CoreError::KeyNotFound { user_id: hex_id(key_id) });
                },
                Err(err) => return Err(err.into()),
            };

        if record.compromised {
            return Ok(());
        }
        record.compromised = true;

        let bytes = store::encode(&record)?;
        retry::with_backoff(&self.env, self.retry, || {
            let store = self.store.clone();
            let bytes = bytes.clone();
            async move { store.put(EPHEMERAL_COLLECTION, &hex_id(key_id), bytes).await }
        })
        .await?;

        self.audit
            .append(
                &hex_id(record.message_id),
                "key_compromised",
                [("key_id".to_string(), hex_id(key_id))].into_iter().collect(),
            )
            .await?;

        tracing::warn!(key_id = %hex_id(key_id), "ephemeral key marked compromised");
        Ok(())
    }

    /// Whether a key has been marked compromised.
    ///
    /// A key with no surviving record reports `false`: records may be
    /// archived out of the store long after their envelopes, and a missing
    /// record carries no evidence of compromise.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on backend failure.
    pub async fn is_compromised(&self, key_id: u128) -> Result<bool, CoreError> {
        match self.store.get(EPHEMERAL_COLLECTION, &hex_id(key_id)).await {
            Ok(bytes) => {
                let record: EphemeralRecord = store::decode(&bytes)?;
                Ok(record.compromised)
            },
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn hex_id(id: u128) -> String {
    format!("{id:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

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
                *byte = (n as u8).wrapping_mul(37).wrapping_add(i as u8) | 1;
            }
        }
    }

    fn broker() -> EphemeralKeyBroker<TestEnv, MemoryStore> {
        let env = TestEnv::new();
        let store = MemoryStore::new();
        let audit = Arc::new(AuditLog::new(env.clone(), store.clone()));
        EphemeralKeyBroker::new(env, store, audit)
    }

    #[tokio::test]
    async fn issue_binds_key_to_message() {
        let broker = broker();
        let key = broker.issue(42).await.unwrap();
        assert_eq!(key.message_id(), 42);
        assert!(!broker.is_compromised(key.key_id()).await.unwrap());
    }

    #[tokio::test]
    async fn issue_never_repeats_material() {
        let broker = broker();
        let a = broker.issue(1).await.unwrap();
        let b = broker.issue(2).await.unwrap();
        assert_ne!(a.material(), b.material());
        assert_ne!(a.key_id(), b.key_id());
    }

    #[tokio::test]
    async fn reissue_for_same_message_is_a_violation() {
        let broker = broker();
        broker.issue(7).await.unwrap();

        let second = broker.issue(7).await;
        assert!(matches!(second, Err(CoreError::KeyReuseViolation { message_id: 7 })));
    }

    #[tokio::test]
    async fn reissue_for_flagged_message_surfaces_the_compromise() {
        let broker = broker();
        let key = broker.issue(7).await.unwrap();
        let key_id = key.key_id();
        broker.mark_compromised(key_id).await.unwrap();

        let second = broker.issue(7).await;
        assert!(
            matches!(second, Err(CoreError::KeyCompromised { key_id: id }) if id == key_id),
            "expected KeyCompromised for key {key_id:x}, got {second:?}"
        );
    }

    #[tokio::test]
    async fn mark_compromised_flips_status() {
        let broker = broker();
        let key = broker.issue(1).await.unwrap();

        broker.mark_compromised(key.key_id()).await.unwrap();
        assert!(broker.is_compromised(key.key_id()).await.unwrap());
    }

    #[tokio::test]
    async fn compromise_is_isolated_to_one_key() {
        let broker = broker();
        let a = broker.issue(1).await.unwrap();
        let b = broker.issue(2).await.unwrap();

        broker.mark_compromised(a.key_id()).await.unwrap();
        assert!(!broker.is_compromised(b.key_id()).await.unwrap());
    }

    #[tokio::test]
    async fn mark_compromised_is_idempotent() {
        let broker = broker();
        let key = broker.issue(1).await.unwrap();

        broker.mark_compromised(key.key_id()).await.unwrap();
        broker.mark_compromised(key.key_id()).await.unwrap();
        assert!(broker.is_compromised(key.key_id()).await.unwrap());
    }

    #[tokio::test]
    async fn mark_compromised_for_unknown_key_fails() {
        let broker = broker();
        let result = broker.mark_compromised(999).await;
        assert!(matches!(result, Err(CoreError::KeyNotFound { .. })));
    }

    #[tokio::test]
    async fn unknown_key_reports_not_compromised() {
        let broker = broker();
        assert!(!broker.is_compromised(123).await.unwrap());
    }

    #[test]
    fn debug_redacts_material() {
        let key = EphemeralKey { key_id: 1, message_id: 2, created_at: 0, material: [0xAB; 32] };
        let rendered = format!("{key:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("171")); // 0xAB
    }
}
