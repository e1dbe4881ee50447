//! Sliding-window rate limiting with escalating penalties.
//!
//! Two windows gate every `(subject, action)` pair: a sliding main window
//! (default 60 events per minute) and a shorter burst window (default 10
//! events per 10 seconds). Exceeding either denies the request with a
//! retry-after duration and advances an escalating penalty state machine:
//!
//! ```text
//! Normal ──violation──▶ Warned ──violation──▶ Penalized(d)
//!    ▲                                            │
//!    └──────────── penalty expires ◀──────────────┘
//! ```
//!
//! Each repeated violation while penalized doubles the next penalty
//! duration (bounded by `max_penalty`), tracked by `violation_count`.
//!
//! ## Concurrency
//!
//! State for a given `(subject, action)` key mutates atomically behind a
//! per-key async mutex; distinct keys never contend. The registry lock
//! protecting the key map is held only to look up or insert an entry,
//! never across store I/O.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    audit::AuditLog,
    env::Environment,
    error::CoreError,
    store::{self, Store, retry},
};

/// Collection holding persisted rate-limit snapshots.
const RATELIMIT_COLLECTION: &str = "ratelimit";

/// Limits and penalty tuning for the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Main sliding window length
    pub window: Duration,
    /// Events allowed inside the main window
    pub window_limit: u32,
    /// Burst window length
    pub burst_window: Duration,
    /// Events allowed inside the burst window
    pub burst_limit: u32,
    /// First penalty duration; doubles per repeat violation
    pub base_penalty: Duration,
    /// Upper bound on any single penalty
    pub max_penalty: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            window_limit: 60,
            burst_window: Duration::from_secs(10),
            burst_limit: 10,
            base_penalty: Duration::from_secs(30),
            max_penalty: Duration::from_secs(3600),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// How long to wait before retrying, when denied
    pub retry_after: Option<Duration>,
}

/// Escalation phase of a `(subject, action)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PenaltyPhase {
    /// No recent violations
    Normal,
    /// One violation; the next one triggers a penalty
    Warned,
    /// Actively penalized until `penalty_until`
    Penalized,
}

/// In-memory state for one `(subject, action)` pair.
///
/// The event queue holds precise timestamps for window math; the persisted
/// snapshot ([`RateLimitSnapshot`]) carries only the coarse counters.
#[derive(Debug)]
struct RateLimitState {
    events: VecDeque<u64>,
    phase: PenaltyPhase,
    violation_count: u32,
    penalty_until: u64,
}

impl RateLimitState {
    fn new() -> Self {
        Self { events: VecDeque::new(), phase: PenaltyPhase::Normal, violation_count: 0, penalty_until: 0 }
    }
}

/// Persisted snapshot of a pair's limiter state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RateLimitSnapshot {
    subject_id: String,
    action: String,
    window_start: u64,
    count: u32,
    violation_count: u32,
    penalty_until: u64,
    phase: PenaltyPhase,
}

/// Abuse-resistant rate limiter with per-key serialization.
pub struct RateLimiter<E, S> {
    env: E,
    store: S,
    audit: Arc<AuditLog<E, S>>,
    config: RateLimitConfig,
    states: Mutex<HashMap<(String, String), Arc<Mutex<RateLimitState>>>>,
    retry: retry::RetryPolicy,
}

impl<E, S> RateLimiter<E, S>
where
    E: Environment,
    S: Store,
{
    /// Create a limiter with the default configuration.
    pub fn new(env: E, store: S, audit: Arc<AuditLog<E, S>>) -> Self {
        Self::with_config(env, store, audit, RateLimitConfig::default())
    }

    /// Create a limiter with explicit limits.
    pub fn with_config(
        env: E,
        store: S,
        audit: Arc<AuditLog<E, S>>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            env,
            store,
            audit,
            config,
            states: Mutex::new(HashMap::new()),
            retry: retry::RetryPolicy::default(),
        }
    }

    /// Check whether `subject_id` may perform `action`, consuming one slot
    /// if allowed.
    ///
    /// Denials carry a retry-after duration and append one
    /// `rate_limit_violation` audit entry.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AuditWriteFailed` if the violation cannot be
    /// recorded; the denial itself is reported through the returned
    /// [`Decision`], not as an error.
    pub async fn check_and_consume(
        &self,
        subject_id: &str,
        action: &str,
    ) -> Result<Decision, CoreError> {
        let entry = self.state_entry(subject_id, action).await;
        let mut state = entry.lock().await;
        let now = self.env.now_millis();

        // Drop events older than the main window
        let window_ms = self.config.window.as_millis() as u64;
        let burst_ms = self.config.burst_window.as_millis() as u64;
        while state.events.front().is_some_and(|t| t + window_ms <= now) {
            state.events.pop_front();
        }

        // Active penalty: deny, and escalate on repeated violations
        if state.phase == PenaltyPhase::Penalized {
            if now < state.penalty_until {
                state.violation_count += 1;
                state.penalty_until = now + self.penalty_ms(state.violation_count);
                let decision = Decision {
                    allowed: false,
                    retry_after: Some(Duration::from_millis(state.penalty_until - now)),
                };
                self.record_violation(subject_id, action, &state, "penalty_extended").await?;
                self.persist_snapshot(subject_id, action, &state, now).await;
                return Ok(decision);
            }
            // Penalty served; back to Normal
            state.phase = PenaltyPhase::Normal;
        }

        let window_count = state.events.len() as u32;
        let burst_count =
            state.events.iter().rev().take_while(|t| **t + burst_ms > now).count() as u32;

        let window_exceeded = window_count >= self.config.window_limit;
        let burst_exceeded = burst_count >= self.config.burst_limit;

        if window_exceeded || burst_exceeded {
            state.violation_count += 1;

            let (phase, retry_after) = match state.phase {
                PenaltyPhase::Normal => {
                    (PenaltyPhase::Warned, self.window_retry_ms(&state, now, burst_exceeded))
                },
                PenaltyPhase::Warned | PenaltyPhase::Penalized => {
                    let penalty = self.penalty_ms(state.violation_count);
                    state.penalty_until = now + penalty;
                    (PenaltyPhase::Penalized, penalty)
                },
            };
            state.phase = phase;

            let decision =
                Decision { allowed: false, retry_after: Some(Duration::from_millis(retry_after)) };
            self.record_violation(subject_id, action, &state, "window_exceeded").await?;
            self.persist_snapshot(subject_id, action, &state, now).await;
            return Ok(decision);
        }

        state.events.push_back(now);
        self.persist_snapshot(subject_id, action, &state, now).await;
        Ok(Decision { allowed: true, retry_after: None })
    }

    /// Penalty duration in millis for the given violation count.
    fn penalty_ms(&self, violation_count: u32) -> u64 {
        let base = self.config.base_penalty.as_millis() as u64;
        let max = self.config.max_penalty.as_millis() as u64;
        let doublings = violation_count.saturating_sub(2).min(16);
        (base << doublings).min(max)
    }

    /// Time until the relevant window has room again.
    ///
    /// A denial happens with exactly `limit` events inside the violated
    /// window, so the slot opens when the oldest of the last `limit`
    /// events ages out. For the burst rule that event sits `burst_limit`
    /// back from the queue tail; older events belong to the main window
    /// only and must not shorten the hint.
    fn window_retry_ms(&self, state: &RateLimitState, now: u64, burst: bool) -> u64 {
        let (span, limit) = if burst {
            (self.config.burst_window.as_millis() as u64, self.config.burst_limit as usize)
        } else {
            (self.config.window.as_millis() as u64, self.config.window_limit as usize)
        };
        state
            .events
            .len()
            .checked_sub(limit)
            .and_then(|index| state.events.get(index))
            .map_or(span, |blocking| (blocking + span).saturating_sub(now).max(1))
    }

    async fn record_violation(
        &self,
        subject_id: &str,
        action: &str,
        state: &RateLimitState,
        kind: &str,
    ) -> Result<(), CoreError> {
        tracing::warn!(subject = %subject_id, action, violations = state.violation_count, "rate limit violation");
        self.audit
            .append(
                subject_id,
                "rate_limit_violation",
                [
                    ("action".to_string(), action.to_string()),
                    ("kind".to_string(), kind.to_string()),
                    ("violations".to_string(), state.violation_count.to_string()),
                ]
                .into_iter()
                .collect(),
            )
            .await
            .map(|_| ())
    }

    /// Persist a coarse snapshot; best-effort, window math never depends
    /// on reading it back.
    async fn persist_snapshot(
        &self,
        subject_id: &str,
        action: &str,
        state: &RateLimitState,
        now: u64,
    ) {
        let snapshot = RateLimitSnapshot {
            subject_id: subject_id.to_string(),
            action: action.to_string(),
            window_start: state.events.front().copied().unwrap_or(now),
            count: state.events.len() as u32,
            violation_count: state.violation_count,
            penalty_until: state.penalty_until,
            phase: state.phase,
        };
        let Ok(bytes) = store::encode(&snapshot) else {
            return;
        };

        let id = format!("{subject_id}/{action}");
        let result = retry::with_backoff(&self.env, self.retry, || {
            let store = self.store.clone();
            let bytes = bytes.clone();
            let id = id.clone();
            async move { store.put(RATELIMIT_COLLECTION, &id, bytes).await }
        })
        .await;

        if let Err(err) = result {
            tracing::debug!(error = %err, "rate limit snapshot not persisted");
        }
    }

    async fn state_entry(&self, subject_id: &str, action: &str) -> Arc<Mutex<RateLimitState>> {
        let mut states = self.states.lock().await;
        Arc::clone(
            states
                .entry((subject_id.to_string(), action.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(RateLimitState::new()))),
        )
    }
}
