//! Tests for rate limiting through the facade.
//!
//! These tests verify critical invariants:
//! - 60 events per sliding minute, 10 per sliding 10 seconds
//! - Escalation: warning first, then exponentially growing penalties
//! - Denials always carry a retry-after hint and one audit entry

use std::time::Duration;

use tipline_core::{
    SecureCore,
    env::test_utils::MockEnv,
    ratelimit::RateLimitConfig,
    store::MemoryStore,
};

fn core_with(limits: RateLimitConfig) -> (SecureCore<MockEnv, MemoryStore>, MockEnv) {
    let env = MockEnv::new();
    (SecureCore::with_rate_limits(env.clone(), MemoryStore::new(), limits), env)
}

/// Default limits with the burst rule effectively disabled, to exercise
/// the per-minute window in isolation.
fn window_only() -> RateLimitConfig {
    RateLimitConfig { burst_limit: u32::MAX, ..RateLimitConfig::default() }
}

/// INVARIANT: 60 calls within one minute pass, the 61st is denied with a
/// positive retry-after.
#[tokio::test]
async fn sixty_per_minute_then_denied() {
    let (core, _) = core_with(window_only());

    for i in 0..60 {
        let decision = core.check_rate_limit("victor", "send").await.expect("check");
        assert!(decision.allowed, "call {i} should be within the window");
    }

    let decision = core.check_rate_limit("victor", "send").await.expect("check");
    assert!(!decision.allowed, "61st call must be denied");
    assert!(
        decision.retry_after.expect("denial carries retry-after") > Duration::ZERO,
        "retry-after must be positive"
    );
}

/// INVARIANT: 10 calls in 10 seconds trip the burst rule even when the
/// minute window still has room.
#[tokio::test]
async fn burst_rule_trips_before_window() {
    let (core, _) = core_with(RateLimitConfig::default());

    for i in 0..10 {
        let decision = core.check_rate_limit("victor", "send").await.expect("check");
        assert!(decision.allowed, "burst call {i} should pass");
    }

    let decision = core.check_rate_limit("victor", "send").await.expect("check");
    assert!(!decision.allowed, "11th call inside 10s must be denied");
}

/// INVARIANT: a burst denial's retry-after reflects the burst window.
/// Older traffic still inside the main window must not shorten the hint
/// to the point where obeying it walks straight into another denial.
#[tokio::test]
async fn burst_retry_after_ignores_stale_window_traffic() {
    let (core, env) = core_with(RateLimitConfig::default());

    // One old event, still inside the 60s window when the burst fires
    core.check_rate_limit("victor", "send").await.expect("check");
    env.advance(Duration::from_secs(30));

    for i in 0..10 {
        let decision = core.check_rate_limit("victor", "send").await.expect("check");
        assert!(decision.allowed, "burst call {i} should pass");
    }

    let denied = core.check_rate_limit("victor", "send").await.expect("check");
    assert!(!denied.allowed, "11th rapid call must be denied by the burst rule");
    assert_eq!(
        denied.retry_after,
        Some(Duration::from_secs(10)),
        "retry-after must wait out the oldest burst event, not the stale one"
    );
}

/// The burst window slides: spacing calls just over a second apart keeps
/// the 10-in-10s rule satisfied indefinitely.
#[tokio::test]
async fn paced_traffic_never_trips_burst() {
    let (core, env) = core_with(RateLimitConfig::default());

    for i in 0..30 {
        let decision = core.check_rate_limit("victor", "send").await.expect("check");
        assert!(decision.allowed, "paced call {i} should pass");
        env.advance(Duration::from_millis(1_100));
    }
}

/// INVARIANT: the first violation is a warning; a repeat violation while
/// warned escalates to a penalty, and each further violation doubles it.
#[tokio::test]
async fn penalties_escalate_exponentially() {
    let limits = RateLimitConfig {
        window: Duration::from_secs(60),
        window_limit: 1,
        base_penalty: Duration::from_secs(30),
        max_penalty: Duration::from_secs(3_600),
        ..window_only()
    };
    let (core, env) = core_with(limits);

    core.check_rate_limit("victor", "send").await.expect("check");

    // Violation 1: warning, retry-after points at window vacancy
    let warned = core.check_rate_limit("victor", "send").await.expect("check");
    assert!(!warned.allowed);
    assert!(warned.retry_after.expect("hint") <= Duration::from_secs(60));

    // Violation 2: first penalty at the base duration
    let penalized = core.check_rate_limit("victor", "send").await.expect("check");
    assert_eq!(penalized.retry_after, Some(Duration::from_secs(30)));

    // Violation 3, still inside the penalty: doubled
    env.advance(Duration::from_secs(1));
    let doubled = core.check_rate_limit("victor", "send").await.expect("check");
    assert_eq!(doubled.retry_after, Some(Duration::from_secs(60)));
}

/// INVARIANT: penalties never exceed the configured maximum.
#[tokio::test]
async fn penalty_is_capped() {
    let limits = RateLimitConfig {
        window: Duration::from_secs(60),
        window_limit: 1,
        base_penalty: Duration::from_secs(30),
        max_penalty: Duration::from_secs(120),
        ..window_only()
    };
    let (core, env) = core_with(limits);

    core.check_rate_limit("victor", "send").await.expect("check");
    for _ in 0..8 {
        let decision = core.check_rate_limit("victor", "send").await.expect("check");
        assert!(
            decision.retry_after.expect("hint") <= Duration::from_secs(120),
            "penalty must stay at or below the cap"
        );
        env.advance(Duration::from_secs(1));
    }
}

/// A served penalty plus a drained window restores normal service.
#[tokio::test]
async fn recovers_after_penalty_and_window() {
    let limits = RateLimitConfig {
        window: Duration::from_secs(60),
        window_limit: 1,
        base_penalty: Duration::from_secs(30),
        ..window_only()
    };
    let (core, env) = core_with(limits);

    core.check_rate_limit("victor", "send").await.expect("check");
    core.check_rate_limit("victor", "send").await.expect("check"); // warned
    core.check_rate_limit("victor", "send").await.expect("check"); // penalized

    env.advance(Duration::from_secs(120));
    let decision = core.check_rate_limit("victor", "send").await.expect("check");
    assert!(decision.allowed, "service must resume after penalty and window expire");
}

/// INVARIANT: limits are tracked per (subject, action) pair; one noisy
/// subject never starves another.
#[tokio::test]
async fn subjects_are_isolated() {
    let limits = RateLimitConfig { window_limit: 1, ..window_only() };
    let (core, _) = core_with(limits);

    core.check_rate_limit("noisy", "send").await.expect("check");
    let denied = core.check_rate_limit("noisy", "send").await.expect("check");
    assert!(!denied.allowed);

    let other_subject = core.check_rate_limit("quiet", "send").await.expect("check");
    assert!(other_subject.allowed, "a different subject must be unaffected");
    let other_action = core.check_rate_limit("noisy", "report").await.expect("check");
    assert!(other_action.allowed, "a different action must be unaffected");
}

/// Every denial appends exactly one rate_limit_violation audit entry.
#[tokio::test]
async fn violations_are_audited() {
    let limits = RateLimitConfig { window_limit: 1, ..window_only() };
    let (core, _) = core_with(limits);

    core.check_rate_limit("victor", "send").await.expect("check");
    core.check_rate_limit("victor", "send").await.expect("check");

    let entries = core.audit_log().entries(0, 100).await.expect("audit read");
    let violations: Vec<_> =
        entries.iter().filter(|e| e.event_type == "rate_limit_violation").collect();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].subject_id, "victor");
    assert_eq!(violations[0].event_data.get("action").map(String::as_str), Some("send"));
}
