//! Bounded retry with exponential backoff for transient store failures.
//!
//! Only `StoreError::Unavailable` is retried; durable errors surface
//! immediately. Callers MUST produce any cryptographic artifacts (nonces,
//! ephemeral keys) once, before entering the retry loop, so a retried
//! persist never multiplies artifacts for one logical operation.

use std::time::Duration;

use crate::{env::Environment, store::StoreError};

/// Retry policy for store operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1)
    pub attempts: u32,
    /// Delay before the first retry; doubles per subsequent retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_delay: Duration::from_millis(50) }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `retry` (0-based).
    fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }
}

/// Run `op` until it succeeds, fails durably, or attempts are exhausted.
///
/// # Errors
///
/// Returns the last error once attempts run out, or the first
/// non-transient error immediately.
pub async fn with_backoff<E, T, F, Fut>(
    env: &E,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, StoreError>
where
    E: Environment,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = policy.attempts.max(1);
    let mut retry = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry + 1 < attempts => {
                let delay = policy.delay_for(retry);
                tracing::debug!(retry, ?delay, error = %err, "store unavailable, backing off");
                env.sleep(delay).await;
                retry += 1;
            },
            Err(err) => return Err(err),
        }
    }
}
