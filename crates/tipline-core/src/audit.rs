//! Append-only, hash-chained audit log with tamper detection.
//!
//! Every security-relevant operation in the core (key rotation, decryption
//! failure, rate-limit violation, anonymous submission) lands here as
//! exactly one entry. Entries form a singly-linked hash chain:
//!
//! ```text
//! integrity_hash[n] = H(prev_hash[n] ‖ seq ‖ subject ‖ event_type ‖ timestamp ‖ data)
//! prev_hash[n]      = integrity_hash[n-1]   (zero hash for the genesis entry)
//! ```
//!
//! Retroactively modifying any persisted entry breaks recomputation at that
//! entry, which `verify_chain` reports as the first point of divergence.
//!
//! ## Ordering
//!
//! Appends are strictly serialized per chain behind a single async mutex -
//! hash-chain correctness depends on one linear history. Sharding is done
//! by constructing one `AuditLog` per partition (distinct collections);
//! cross-partition ordering is explicitly not guaranteed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{
    env::Environment,
    error::CoreError,
    store::{self, Store, StoreError, WriteOp, retry},
};

/// Collection holding chain entries.
const DEFAULT_COLLECTION: &str = "audit";

/// Record ID of the chain-head record, kept outside the entry ID space.
const HEAD_ID: &str = "head";

/// Zero hash linking the genesis entry.
const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// One immutable entry in the audit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Dense per-chain sequence number, starting at 0
    pub seq: u64,
    /// Subject the event concerns (user, case, or rate-limit subject)
    pub subject_id: String,
    /// Event type, e.g. `key_rotation` or `rate_limit_violation`
    pub event_type: String,
    /// Structured event payload; ordered map so hashing is canonical
    pub event_data: BTreeMap<String, String>,
    /// Wall-clock milliseconds when the entry was appended
    pub timestamp: u64,
    /// Integrity hash of the previous entry (zero for genesis)
    pub prev_hash: [u8; 32],
    /// Hash binding this entry to the chain
    pub integrity_hash: [u8; 32],
}

/// Result of verifying a chain range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// True if every entry in the range recomputes and links correctly
    pub valid: bool,
    /// Sequence number of the first diverging entry, if any
    pub first_invalid: Option<u64>,
}

/// Persisted chain head, advanced atomically with each append.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainHead {
    next_seq: u64,
    last_hash: [u8; 32],
}

/// Append-only hash-chained audit log.
///
/// One instance owns one chain. Appends serialize behind an internal
/// mutex; reads go straight to the store.
pub struct AuditLog<E, S> {
    env: E,
    store: S,
    collection: String,
    head: Mutex<ChainHead>,
    retry: retry::RetryPolicy,
}

impl<E, S> AuditLog<E, S>
where
    E: Environment,
    S: Store,
{
    /// Create a log over a fresh chain in the default collection.
    pub fn new(env: E, store: S) -> Self {
        Self::with_collection(env, store, DEFAULT_COLLECTION)
    }

    /// Create a log over a fresh chain in a named collection (partition).
    pub fn with_collection(env: E, store: S, collection: &str) -> Self {
        Self {
            env,
            store,
            collection: collection.to_string(),
            head: Mutex::new(ChainHead { next_seq: 0, last_hash: GENESIS_HASH }),
            retry: retry::RetryPolicy::default(),
        }
    }

    /// Resume a log from its persisted chain head.
    ///
    /// A missing head record means an empty chain, not an error.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` if the head record cannot be read.
    pub async fn open(env: E, store: S, collection: &str) -> Result<Self, CoreError> {
        let head = match store.get(collection, HEAD_ID).await {
            Ok(bytes) => store::decode(&bytes)?,
            Err(StoreError::NotFound { .. }) => {
                ChainHead { next_seq: 0, last_hash: GENESIS_HASH }
            },
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            env,
            store,
            collection: collection.to_string(),
            head: Mutex::new(head),
            retry: retry::RetryPolicy::default(),
        })
    }

    /// Append an event to the chain.
    ///
    /// The entry and the advanced chain head are written in one batch; the
    /// in-memory head only advances after the store acknowledges, so a
    /// failed append leaves the chain unchanged.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AuditWriteFailed` if the store rejects the write
    /// after bounded retries. This is fatal: security events must never be
    /// silently dropped.
    pub async fn append(
        &self,
        subject_id: &str,
        event_type: &str,
        event_data: BTreeMap<String, String>,
    ) -> Result<AuditEntry, CoreError> {
        let mut head = self.head.lock().await;

        let timestamp = self.env.now_millis();
        let mut entry = AuditEntry {
            seq: head.next_seq,
            subject_id: subject_id.to_string(),
            event_type: event_type.to_string(),
            event_data,
            timestamp,
            prev_hash: head.last_hash,
            integrity_hash: [0u8; 32],
        };
        entry.integrity_hash = compute_integrity_hash(&entry);

        let entry_bytes = store::encode(&entry)
            .map_err(|e| CoreError::AuditWriteFailed { reason: e.to_string() })?;
        let head_bytes =
            store::encode(&ChainHead { next_seq: entry.seq + 1, last_hash: entry.integrity_hash })
                .map_err(|e| CoreError::AuditWriteFailed { reason: e.to_string() })?;

        let ops = vec![
            WriteOp::Put {
                collection: self.collection.clone(),
                id: entry_id(entry.seq),
                record: entry_bytes,
            },
            WriteOp::Put {
                collection: self.collection.clone(),
                id: HEAD_ID.to_string(),
                record: head_bytes,
            },
        ];

        retry::with_backoff(&self.env, self.retry, || {
            let store = self.store.clone();
            let ops = ops.clone();
            async move { store.batch_write(ops).await }
        })
        .await
        .map_err(|e| CoreError::AuditWriteFailed { reason: e.to_string() })?;

        head.next_seq = entry.seq + 1;
        head.last_hash = entry.integrity_hash;
        drop(head);

        tracing::info!(
            seq = entry.seq,
            subject = %entry.subject_id,
            event = %entry.event_type,
            "audit entry appended"
        );

        Ok(entry)
    }

    /// Load entries in `[from_seq, to_seq]`, ascending.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on backend failure or if an entry fails
    /// to decode.
    pub async fn entries(&self, from_seq: u64, to_seq: u64) -> Result<Vec<AuditEntry>, CoreError> {
        let records = self
            .store
            .query_range(&self.collection, &entry_id(from_seq), &entry_id(to_seq))
            .await?;

        let mut entries = Vec::with_capacity(records.len());
        for (_, bytes) in records {
            entries.push(store::decode::<AuditEntry>(&bytes)?);
        }
        Ok(entries)
    }

    /// Verify the chain over `[from_seq, to_seq]`.
    ///
    /// Recomputes each entry's integrity hash and checks each `prev_hash`
    /// link against its predecessor in the range. Reports the first point
    /// of divergence; callers treat divergence as a fatal
    /// `IntegrityViolation`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` if the range cannot be read. Tampering
    /// is reported through the returned [`ChainVerification`], not as an
    /// error.
    pub async fn verify_chain(
        &self,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<ChainVerification, CoreError> {
        let entries = self.entries(from_seq, to_seq).await?;

        let mut expected_seq = from_seq;
        let mut prev_hash: Option<[u8; 32]> = None;

        for entry in &entries {
            let recomputed = compute_integrity_hash(entry);
            let link_ok = prev_hash.is_none_or(|h| h == entry.prev_hash);

            if entry.seq != expected_seq || recomputed != entry.integrity_hash || !link_ok {
                tracing::warn!(seq = entry.seq, "audit chain divergence detected");
                return Ok(ChainVerification { valid: false, first_invalid: Some(entry.seq) });
            }

            prev_hash = Some(entry.integrity_hash);
            expected_seq = entry.seq + 1;
        }

        Ok(ChainVerification { valid: true, first_invalid: None })
    }
}

/// Zero-padded entry ID so store range queries come back in sequence order.
fn entry_id(seq: u64) -> String {
    format!("{seq:020}")
}

/// Canonical integrity hash over an entry's immutable fields.
///
/// Every variable-length field is length-prefixed so no two field
/// boundaries can alias.
fn compute_integrity_hash(entry: &AuditEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.prev_hash);
    hasher.update(entry.seq.to_be_bytes());
    update_lengthed(&mut hasher, entry.subject_id.as_bytes());
    update_lengthed(&mut hasher, entry.event_type.as_bytes());
    hasher.update(entry.timestamp.to_be_bytes());
    hasher.update((entry.event_data.len() as u64).to_be_bytes());
    for (key, value) in &entry.event_data {
        update_lengthed(&mut hasher, key.as_bytes());
        update_lengthed(&mut hasher, value.as_bytes());
    }
    hasher.finalize().into()
}

fn update_lengthed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        fn now_millis(&self) -> u64 {
            1_700_000_000_000
        }

        fn sleep(&self, _d: std::time::Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(3);
        }
    }

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn appends_form_a_linked_chain() {
        let log = AuditLog::new(TestEnv, MemoryStore::new());

        let first = log.append("u1", "key_rotation", data(&[])).await.unwrap();
        let second = log.append("u1", "key_rotation", data(&[])).await.unwrap();

        assert_eq!(first.seq, 0);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.seq, 1);
        assert_eq!(second.prev_hash, first.integrity_hash);
    }

    #[tokio::test]
    async fn clean_chain_verifies() {
        let log = AuditLog::new(TestEnv, MemoryStore::new());
        for i in 0..5 {
            log.append("u1", "event", data(&[("n", &i.to_string())])).await.unwrap();
        }

        let verification = log.verify_chain(0, 4).await.unwrap();
        assert!(verification.valid);
        assert_eq!(verification.first_invalid, None);
    }

    #[tokio::test]
    async fn mutated_entry_is_detected() {
        let store = MemoryStore::new();
        let log = AuditLog::new(TestEnv, store.clone());
        for i in 0..5 {
            log.append("u1", "event", data(&[("n", &i.to_string())])).await.unwrap();
        }

        // Attacker with storage access rewrites entry 2's payload
        let mut entries = log.entries(2, 2).await.unwrap();
        let mut tampered = entries.remove(0);
        tampered.event_data.insert("n".to_string(), "999".to_string());
        store.corrupt("audit", &entry_id(2), store::encode(&tampered).unwrap());

        let verification = log.verify_chain(0, 4).await.unwrap();
        assert!(!verification.valid);
        assert_eq!(verification.first_invalid, Some(2));
    }

    #[tokio::test]
    async fn failed_append_leaves_chain_unchanged() {
        let store = MemoryStore::new();
        let log = AuditLog::new(TestEnv, store.clone());
        log.append("u1", "event", data(&[])).await.unwrap();

        // Outlast every retry attempt
        store.fail_next(10);
        let result = log.append("u1", "event", data(&[])).await;
        assert!(matches!(result, Err(CoreError::AuditWriteFailed { .. })));

        // Next successful append continues from seq 1
        let entry = log.append("u1", "event", data(&[])).await.unwrap();
        assert_eq!(entry.seq, 1);
        assert!(log.verify_chain(0, 1).await.unwrap().valid);
    }

    #[tokio::test]
    async fn transient_outage_is_absorbed_by_retry() {
        let store = MemoryStore::new();
        let log = AuditLog::new(TestEnv, store.clone());

        store.fail_next(1);
        let entry = log.append("u1", "event", data(&[])).await.unwrap();
        assert_eq!(entry.seq, 0);
    }

    #[tokio::test]
    async fn reopened_log_continues_the_chain() {
        let store = MemoryStore::new();
        let last_hash;
        {
            let log = AuditLog::new(TestEnv, store.clone());
            log.append("u1", "event", data(&[])).await.unwrap();
            last_hash = log.append("u1", "event", data(&[])).await.unwrap().integrity_hash;
        }

        let resumed = AuditLog::open(TestEnv, store, "audit").await.unwrap();
        let entry = resumed.append("u1", "event", data(&[])).await.unwrap();
        assert_eq!(entry.seq, 2);
        assert_eq!(entry.prev_hash, last_hash);
        assert!(resumed.verify_chain(0, 2).await.unwrap().valid);
    }

    #[test]
    fn hash_distinguishes_field_boundaries() {
        let base = AuditEntry {
            seq: 0,
            subject_id: "ab".to_string(),
            event_type: "cd".to_string(),
            event_data: BTreeMap::new(),
            timestamp: 0,
            prev_hash: GENESIS_HASH,
            integrity_hash: [0u8; 32],
        };
        let mut shifted = base.clone();
        shifted.subject_id = "a".to_string();
        shifted.event_type = "bcd".to_string();

        assert_ne!(compute_integrity_hash(&base), compute_integrity_hash(&shifted));
    }
}
