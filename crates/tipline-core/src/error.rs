//! Error taxonomy for the security core.
//!
//! One enum covers every component so callers handle a single type at the
//! facade. Each variant classifies itself as fatal or recoverable via
//! [`CoreError::is_fatal`]; fatal errors must never be retried.

use std::time::Duration;

use thiserror::Error;
use tipline_crypto::CryptoError;

use crate::store::StoreError;

/// Errors from security-core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Key pair generation failed (entropy-source failure)
    #[error("key generation failed: {reason}")]
    KeyGeneration {
        /// Reason generation was rejected
        reason: String,
    },

    /// No key exists for the requested user or key ID
    #[error("key not found for user {user_id}")]
    KeyNotFound {
        /// User whose key was requested
        user_id: String,
    },

    /// The ephemeral key for this message was marked compromised
    #[error("ephemeral key is compromised: {key_id:032x}")]
    KeyCompromised {
        /// The compromised key ID
        key_id: u128,
    },

    /// An ephemeral key was requested twice for the same message
    ///
    /// Keys are strictly single-use; reuse is a logic error in the caller,
    /// not a recoverable condition.
    #[error("ephemeral key reuse for message {message_id:032x}")]
    KeyReuseViolation {
        /// Message the key was already issued for
        message_id: u128,
    },

    /// Decryption failed.
    ///
    /// Covers tampering, wrong key, and compromised ephemeral key.
    /// Deliberately unified: distinguishing the causes would hand an
    /// attacker a decryption oracle.
    #[error("message could not be verified")]
    DecryptionFailed,

    /// The operation was denied by the rate limiter
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long the caller must wait before retrying
        retry_after: Duration,
    },

    /// Input was malformed or malicious
    #[error("validation failed: {reason}")]
    ValidationFailed {
        /// What the input violated
        reason: String,
    },

    /// An audit entry could not be persisted.
    ///
    /// Fatal: security events must never be silently dropped.
    #[error("audit write failed: {reason}")]
    AuditWriteFailed {
        /// Underlying storage failure
        reason: String,
    },

    /// The audit hash chain failed verification.
    ///
    /// Fatal: halt and alert, never auto-heal. The first diverging entry
    /// identifies where tampering or corruption begins.
    #[error("audit chain integrity violation at sequence {first_invalid}")]
    IntegrityViolation {
        /// First entry whose hash no longer matches
        first_invalid: u64,
    },

    /// Storage error after retries were exhausted
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors indicate tampering, compromise, or a logic bug, and
    /// must be surfaced verbatim - never downgraded into a generic retry.
    /// Recoverable errors carry enough structure to act on (e.g., the
    /// retry-after duration on [`CoreError::RateLimited`]).
    pub fn is_fatal(&self) -> bool {
        match self {
            // Compromise and tampering - fatal
            Self::DecryptionFailed
            | Self::KeyCompromised { .. }
            | Self::KeyReuseViolation { .. }
            | Self::AuditWriteFailed { .. }
            | Self::IntegrityViolation { .. } => true,

            // Recoverable with caller action
            Self::KeyGeneration { .. }
            | Self::KeyNotFound { .. }
            | Self::RateLimited { .. }
            | Self::ValidationFailed { .. }
            | Self::Store(_) => false,
        }
    }
}

impl From<CryptoError> for CoreError {
    /// Collapse crypto-layer failures into the unified taxonomy.
    ///
    /// `DecryptionFailed` and `InvalidKeyLength` both surface as the single
    /// opaque decryption failure; only entropy problems keep their shape.
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyGeneration { reason } => Self::KeyGeneration { reason },
            CryptoError::DecryptionFailed | CryptoError::InvalidKeyLength { .. } => {
                Self::DecryptionFailed
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_violation_is_fatal() {
        assert!(CoreError::IntegrityViolation { first_invalid: 3 }.is_fatal());
    }

    #[test]
    fn audit_write_failure_is_fatal() {
        let err = CoreError::AuditWriteFailed { reason: "store down".to_string() };
        assert!(err.is_fatal());
    }

    #[test]
    fn rate_limited_is_recoverable_and_carries_guidance() {
        let err = CoreError::RateLimited { retry_after: Duration::from_secs(30) };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("retry after"));
    }

    #[test]
    fn crypto_failures_unify_to_opaque_decryption_error() {
        let from_tag = CoreError::from(CryptoError::DecryptionFailed);
        let from_len = CoreError::from(CryptoError::InvalidKeyLength { expected: 32, actual: 16 });
        assert!(matches!(from_tag, CoreError::DecryptionFailed));
        assert!(matches!(from_len, CoreError::DecryptionFailed));
    }

    #[test]
    fn decryption_error_message_is_opaque() {
        // User-visible text must not leak internal cryptographic state
        let msg = CoreError::DecryptionFailed.to_string();
        assert!(!msg.contains("tag"));
        assert!(!msg.contains("key"));
    }
}
