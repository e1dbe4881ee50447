//! Storage error types.
//!
//! Defines errors that can occur during store operations:
//! - `NotFound`: Requested record doesn't exist
//! - `Serialization`: Failed to encode/decode a record
//! - `Unavailable`: Transient backend failure, retryable with backoff

use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record not found
    #[error("record not found: {collection}/{id}")]
    NotFound {
        /// Collection that was queried
        collection: String,
        /// Record ID that was not found
        id: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend temporarily unavailable
    ///
    /// The store is treated as eventually-available; callers retry this
    /// with bounded exponential backoff before surfacing it.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether this error may clear on retry.
    ///
    /// Only `Unavailable` is transient; `NotFound` and `Serialization`
    /// reflect durable state and retrying cannot help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
