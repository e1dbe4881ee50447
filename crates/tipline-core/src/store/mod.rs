//! Storage abstraction for the security core.
//!
//! The core depends on, but does not implement, a generic persistent store.
//! Records are opaque CBOR blobs addressed by `(collection, id)`; the store
//! is treated as eventually-available and transient failures are retried
//! with bounded backoff (see [`retry`]).

mod error;
mod memory;
pub mod retry;

pub use error::StoreError;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

/// A single operation inside a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a record
    Put {
        /// Collection the record belongs to
        collection: String,
        /// Record ID within the collection
        id: String,
        /// CBOR-encoded record body
        record: Vec<u8>,
    },
    /// Delete a record if present
    Delete {
        /// Collection the record belongs to
        collection: String,
        /// Record ID within the collection
        id: String,
    },
}

/// Abstract persistent store.
///
/// This trait must be:
/// - Clone: shared by every service in the core
/// - Send + Sync: safe under concurrent service calls
/// - Async: no service may block a shared thread on store I/O
///
/// # Clone Semantics
///
/// Implementations typically share internal state via Arc, meaning clones
/// access the same underlying storage.
///
/// # Ordering
///
/// `query_range` returns records in ascending ID order; callers that need
/// a linear history (the audit chain) encode sequence numbers as
/// zero-padded IDs.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Fetch a record by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record exists, or
    /// `StoreError::Unavailable` on transient backend failure.
    async fn get(&self, collection: &str, id: &str) -> Result<Vec<u8>, StoreError>;

    /// Insert or overwrite a record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` on transient backend failure.
    async fn put(&self, collection: &str, id: &str, record: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch all records whose IDs fall in `[start, end]` (inclusive),
    /// in ascending ID order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` on transient backend failure.
    /// An empty range is `Ok(vec![])`, not an error.
    async fn query_range(
        &self,
        collection: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Apply a batch of writes.
    ///
    /// The batch is applied in order; implementations need not make it
    /// atomic, and callers must tolerate a prefix having been applied
    /// after an `Unavailable` failure.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` on transient backend failure.
    async fn batch_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;
}

/// Encode a record as CBOR for persistence.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the value cannot be encoded.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR record fetched from the store.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the bytes are not a valid
/// encoding of `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
