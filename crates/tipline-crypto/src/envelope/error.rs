//! Error types for envelope operations

use thiserror::Error;

/// Errors from envelope encryption operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key pair generation failed (bad or missing entropy)
    #[error("key generation failed: {reason}")]
    KeyGeneration {
        /// Reason generation was rejected
        reason: String,
    },

    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Decryption failed.
    ///
    /// Deliberately carries no detail: authentication-tag mismatch and
    /// wrong-key failures are indistinguishable to the caller so the error
    /// cannot be used as a decryption oracle.
    #[error("decryption failed")]
    DecryptionFailed,
}

impl CryptoError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors indicate tampering, wrong keys, or a logic bug.
    /// Transient errors may be recoverable by retrying with fresh entropy.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::DecryptionFailed | Self::InvalidKeyLength { .. } => true,
            Self::KeyGeneration { .. } => false,
        }
    }
}
