//! Identity key lifecycle management.
//!
//! Generates, rotates, and retrieves long-term identity key pairs. Retired
//! keys are preserved indefinitely so messages encrypted under an old key
//! stay decryptable after rotation.
//!
//! ## Responsibilities
//!
//! 1. **Generation**: fresh X25519 pairs from environment entropy
//! 2. **Rotation**: current key retired (never deleted), new key activated
//! 3. **History**: ordered per-user key history, addressable by key ID
//! 4. **Audit**: every generation and rotation appends a `key_rotation`
//!    audit entry
//!
//! ## Serialization of operations
//!
//! Operations for one `user_id` are serialized behind a per-user async
//! mutex - a rotation in progress cannot race a concurrent read of the
//! same user's active key - while unrelated users proceed independently.
//!
//! ## Key hygiene
//!
//! Secret key material stays inside this module and the crypto crate.
//! Public accessors return a metadata view ([`KeyPair`]) without the
//! secret; no error path and no `Debug` impl ever renders secret bytes.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tipline_crypto::IdentityKeyPair;
use tokio::sync::Mutex;
use zeroize::Zeroize;

use crate::{
    audit::AuditLog,
    env::Environment,
    error::CoreError,
    store::{self, Store, StoreError, WriteOp, retry},
};

/// Collection holding per-user key records.
const KEYS_COLLECTION: &str = "keys";

/// Collection mapping `user_id` to the active key ID.
const ACTIVE_COLLECTION: &str = "keys_active";

/// Lifecycle state of an identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Current key for new encryptions
    Active,
    /// Rotated out; kept for decrypting historical messages
    Retired,
}

/// Metadata view of an identity key pair.
///
/// This is what crosses the component boundary. The secret half never
/// appears here; decryption paths access it only through crate-internal
/// accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Owner of the key
    pub user_id: String,
    /// Unique key ID within the user's history
    pub key_id: u128,
    /// X25519 public key bytes
    pub public_key: [u8; 32],
    /// One-way fingerprint of the public key
    pub fingerprint: String,
    /// When the key was generated (epoch millis)
    pub created_at: u64,
    /// When the key was retired, if it has been
    pub rotated_at: Option<u64>,
    /// Lifecycle state
    pub status: KeyStatus,
}

/// Persisted key record, including the secret half.
///
/// Only this module reads or writes these records. Deliberately no
/// `Debug` derive: the secret must never reach a log or error message.
/// The secret bytes are wiped when the record drops; transient encode
/// and decode buffers are wiped by the callers that hold them. No
/// `Clone`: each copy of the secret is created deliberately or not at
/// all.
#[derive(Serialize, Deserialize)]
struct KeyRecord {
    user_id: String,
    key_id: u128,
    public: [u8; 32],
    secret: [u8; 32],
    created_at: u64,
    rotated_at: Option<u64>,
    status: KeyStatus,
}

impl Zeroize for KeyRecord {
    fn zeroize(&mut self) {
        self.secret.zeroize();
    }
}

impl Drop for KeyRecord {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl KeyRecord {
    fn metadata(&self) -> KeyPair {
        KeyPair {
            user_id: self.user_id.clone(),
            key_id: self.key_id,
            public_key: self.public,
            fingerprint: tipline_crypto::PublicKey::from_bytes(self.public)
                .fingerprint()
                .as_str()
                .to_string(),
            created_at: self.created_at,
            rotated_at: self.rotated_at,
            status: self.status,
        }
    }
}

/// Pointer from a user to their active key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActivePointer {
    key_id: u128,
}

/// Manages identity key pairs for all users.
pub struct KeyManager<E, S> {
    env: E,
    store: S,
    audit: Arc<AuditLog<E, S>>,
    /// Per-user operation locks; the registry lock is held only to fetch
    /// or insert an entry, never across store I/O.
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retry: retry::RetryPolicy,
}

impl<E, S> KeyManager<E, S>
where
    E: Environment,
    S: Store,
{
    /// Create a key manager over the given store and audit log.
    pub fn new(env: E, store: S, audit: Arc<AuditLog<E, S>>) -> Self {
        Self {
            env,
            store,
            audit,
            user_locks: Mutex::new(HashMap::new()),
            retry: retry::RetryPolicy::default(),
        }
    }

    /// Generate the first key pair for a user.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationFailed` if the user already has an
    /// active key (rotation is the operation for that case), or
    /// `CoreError::KeyGeneration` on entropy-source failure.
    pub async fn generate(&self, user_id: &str) -> Result<KeyPair, CoreError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        if self.load_active(user_id).await?.is_some() {
            return Err(CoreError::ValidationFailed {
                reason: format!("user {user_id} already has an active key"),
            });
        }

        self.install_new_key(user_id, "generate").await
    }

    /// Rotate a user's keys.
    ///
    /// Marks the current active key `Retired` (preserving it indefinitely
    /// for historical decryption) and activates a freshly generated key.
    /// A user with no key yet simply gets their first one, which makes
    /// the operation safe for an external scheduler to invoke blindly.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KeyGeneration` on entropy-source failure or
    /// `CoreError::Store` if persistence fails after retries.
    pub async fn rotate(&self, user_id: &str) -> Result<KeyPair, CoreError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        if let Some(mut current) = self.load_active(user_id).await? {
            current.status = KeyStatus::Retired;
            current.rotated_at = Some(self.env.now_millis());
            let mut record_bytes = store::encode(&current)?;
            let id = record_id(user_id, current.key_id);
            let result = retry::with_backoff(&self.env, self.retry, || {
                let store = self.store.clone();
                let record_bytes = record_bytes.clone();
                let id = id.clone();
                async move { store.put(KEYS_COLLECTION, &id, record_bytes).await }
            })
            .await;
            record_bytes.zeroize();
            result?;
        }

        self.install_new_key(user_id, "rotate").await
    }

    /// The user's current active key.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KeyNotFound` if the user has no active key.
    pub async fn active(&self, user_id: &str) -> Result<KeyPair, CoreError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        self.load_active(user_id)
            .await?
            .map(|record| record.metadata())
            .ok_or_else(|| CoreError::KeyNotFound { user_id: user_id.to_string() })
    }

    /// A specific key from the user's history, active or retired.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::KeyNotFound` if no such key exists.
    pub async fn historical(&self, user_id: &str, key_id: u128) -> Result<KeyPair, CoreError> {
        Ok(self.load_record(user_id, key_id).await?.metadata())
    }

    /// Active public key and its ID, for sealing a new message.
    pub(crate) async fn active_sealing_key(
        &self,
        user_id: &str,
    ) -> Result<(u128, tipline_crypto::PublicKey), CoreError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let record = self
            .load_active(user_id)
            .await?
            .ok_or_else(|| CoreError::KeyNotFound { user_id: user_id.to_string() })?;
        Ok((record.key_id, tipline_crypto::PublicKey::from_bytes(record.public)))
    }

    /// Reconstruct the full key pair whose public key has the given
    /// fingerprint, searching the user's entire history.
    ///
    /// Used by the decryption path so messages sealed under a since-rotated
    /// key still open.
    pub(crate) async fn unsealing_key(
        &self,
        user_id: &str,
        fingerprint: &str,
    ) -> Result<IdentityKeyPair, CoreError> {
        let records = self.load_history(user_id).await?;
        for record in records {
            let public = tipline_crypto::PublicKey::from_bytes(record.public);
            if public.fingerprint().as_str() == fingerprint {
                return Ok(IdentityKeyPair::from_secret_bytes(record.secret));
            }
        }
        Err(CoreError::KeyNotFound { user_id: user_id.to_string() })
    }

    /// Generate, persist, and audit a new active key for `user_id`.
    ///
    /// Caller must hold the user's lock.
    async fn install_new_key(&self, user_id: &str, operation: &str) -> Result<KeyPair, CoreError> {
        let pair = IdentityKeyPair::from_entropy(self.env.random_array())?;
        let key_id = self.env.random_u128();
        let now = self.env.now_millis();

        let record = KeyRecord {
            user_id: user_id.to_string(),
            key_id,
            public: *pair.public().as_bytes(),
            secret: pair.secret_bytes(),
            created_at: now,
            rotated_at: None,
            status: KeyStatus::Active,
        };

        let mut ops = vec![
            WriteOp::Put {
                collection: KEYS_COLLECTION.to_string(),
                id: record_id(user_id, key_id),
                record: store::encode(&record)?,
            },
            WriteOp::Put {
                collection: ACTIVE_COLLECTION.to_string(),
                id: user_id.to_string(),
                record: store::encode(&ActivePointer { key_id })?,
            },
        ];

        let result = retry::with_backoff(&self.env, self.retry, || {
            let store = self.store.clone();
            let ops = ops.clone();
            async move { store.batch_write(ops).await }
        })
        .await;
        for op in &mut ops {
            if let WriteOp::Put { record, .. } = op {
                record.zeroize();
            }
        }
        result?;

        let metadata = record.metadata();

        self.audit
            .append(
                user_id,
                "key_rotation",
                [
                    ("operation".to_string(), operation.to_string()),
                    ("fingerprint".to_string(), metadata.fingerprint.clone()),
                ]
                .into_iter()
                .collect(),
            )
            .await?;

        tracing::info!(user = %user_id, operation, fingerprint = %metadata.fingerprint, "identity key installed");

        Ok(metadata)
    }

    async fn load_active(&self, user_id: &str) -> Result<Option<KeyRecord>, CoreError> {
        let pointer: ActivePointer = match self.store.get(ACTIVE_COLLECTION, user_id).await {
            Ok(bytes) => store::decode(&bytes)?,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(self.load_record(user_id, pointer.key_id).await?))
    }

    async fn load_record(&self, user_id: &str, key_id: u128) -> Result<KeyRecord, CoreError> {
        match self.store.get(KEYS_COLLECTION, &record_id(user_id, key_id)).await {
            Ok(mut bytes) => {
                let record = store::decode(&bytes);
                bytes.zeroize();
                Ok(record?)
            },
            Err(StoreError::NotFound { .. }) => {
                Err(CoreError::KeyNotFound { user_id: user_id.to_string() })
            },
            Err(err) => Err(err.into()),
        }
    }

    async fn load_history(&self, user_id: &str) -> Result<Vec<KeyRecord>, CoreError> {
        let records = self
            .store
            .query_range(
                KEYS_COLLECTION,
                &format!("{user_id}/{:032x}", 0u128),
                &format!("{user_id}/{:032x}", u128::MAX),
            )
            .await?;

        let mut history = Vec::with_capacity(records.len());
        for (_, mut bytes) in records {
            let record = store::decode::<KeyRecord>(&bytes);
            bytes.zeroize();
            history.push(record?);
        }
        Ok(history)
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        Arc::clone(locks.entry(user_id.to_string()).or_default())
    }
}

/// Record ID for a key within its user's ordered history.
fn record_id(user_id: &str, key_id: u128) -> String {
    format!("{user_id}/{key_id:032x}")
}
