//! Tipline Core
//!
//! Secure, anonymity-preserving messaging substrate. Combines end-to-end
//! message encryption with key rotation and forward secrecy, a sender
//! anonymization layer for whistleblower-style reports, an abuse-resistant
//! rate limiter, and a tamper-evident audit log.
//!
//! ## Architecture
//!
//! ```text
//! SecureCore (facade, dependency injection)
//!   ├─ KeyManager        (identity key lifecycle, per-user serialization)
//!   ├─ EphemeralKeyBroker (one-time keys, compromise tracking)
//!   ├─ MessageCipher     (hybrid AEAD envelopes, stateless)
//!   ├─ AnonymizationProxy (identity stripping, unlinkable routing)
//!   ├─ RateLimiter       (sliding window + escalating penalties)
//!   ├─ AuditLog          (hash-chained append-only log)
//!   ├─ FraudDetector     (pure scan over the audit stream)
//!   └─ Store             (abstract persistent store, external)
//! ```
//!
//! ## Design Decisions
//!
//! - **No globals**: every service is an explicit struct constructed once
//!   and passed by handle; state is partitioned per key (`user_id`,
//!   `subject_id`) rather than shared mutable maps
//! - **Narrow seams**: cryptography, storage, and time/randomness sit
//!   behind the `tipline-crypto` API, the [`store::Store`] trait, and the
//!   [`env::Environment`] trait so tests substitute deterministic
//!   implementations without weakening the production path
//! - **No timers**: rotation and archival are idempotent operations an
//!   external scheduler invokes; the core owns no background threads
//! - **Fatal vs recoverable**: every error classifies itself via
//!   [`error::CoreError::is_fatal`] so callers cannot accidentally retry
//!   past an integrity violation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod anonymize;
pub mod audit;
pub mod cipher;
pub mod env;
pub mod ephemeral;
pub mod error;
pub mod fraud;
pub mod keys;
pub mod ratelimit;
pub mod service;
pub mod store;

pub use env::{Environment, SystemEnv};
pub use error::CoreError;
pub use service::SecureCore;
