//! Integration tests for conduit-reliability.
//!
//! These drive the classifier and breaker together the way the agent engine
//! does: classify a failure, record it against its category, and consult the
//! breaker before the next attempt.

use std::sync::Arc;
use std::time::Duration;

use conduit_reliability::{
    BreakerConfig, CircuitBreaker, CircuitStatus, ErrorCategory, ErrorContext, ErrorSeverity,
    RecoveryAction, ReliabilityError, classify,
};

fn breaker(failure_threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(BreakerConfig {
        failure_threshold,
        success_threshold: 2,
        reset_timeout_ms: 60_000,
    })
}

// ── breaker scenario ──────────────────────────────────────────────────────────

/// Three NETWORK failures open the circuit; 61 seconds later the next query
/// moves it to HALF_OPEN and lets the call through.
#[tokio::test(start_paused = true)]
async fn network_circuit_opens_and_half_opens() {
    let cb = breaker(3);

    for _ in 0..3 {
        cb.record_failure(ErrorCategory::Network);
    }
    assert!(cb.should_reject(ErrorCategory::Network));

    tokio::time::advance(Duration::from_millis(61_000)).await;

    assert!(!cb.should_reject(ErrorCategory::Network));
    assert_eq!(cb.status(ErrorCategory::Network), CircuitStatus::HalfOpen);
}

#[tokio::test]
async fn classified_failures_trip_their_own_category() {
    let cb = breaker(2);

    for raw in ["connect ECONNREFUSED 127.0.0.1:8080", "socket hang up"] {
        let err = classify(raw, ErrorContext::component("llm"));
        cb.record_failure(err.category);
    }

    assert!(cb.should_reject(ErrorCategory::Network));
    for other in ErrorCategory::ALL
        .into_iter()
        .filter(|c| *c != ErrorCategory::Network)
    {
        assert!(!cb.should_reject(other), "{other} must stay closed");
    }
}

#[tokio::test]
async fn concurrent_failures_are_not_lost() {
    let cb = Arc::new(breaker(1_000));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cb = Arc::clone(&cb);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                cb.record_failure(ErrorCategory::ExternalService);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let snap = cb.snapshot(ErrorCategory::ExternalService).unwrap();
    assert_eq!(snap.failure_count, 400);
    assert_eq!(snap.status, CircuitStatus::Closed);
}

#[tokio::test]
async fn open_rejection_is_distinguishable() {
    let cb = breaker(1);
    cb.record_failure(ErrorCategory::ExternalService);

    let result: Result<(), ReliabilityError> = cb
        .guard(ErrorCategory::ExternalService, async { Ok(()) })
        .await;
    let err = result.unwrap_err();
    assert!(err.is_circuit_open());
    assert!(err.to_string().contains("EXTERNAL_SERVICE"));
}

// ── classifier scenario ───────────────────────────────────────────────────────

#[test]
fn econnrefused_scenario() {
    let err = classify("connect ECONNREFUSED 127.0.0.1:8080", ErrorContext::new());

    assert_eq!(err.category, ErrorCategory::Network);
    assert_eq!(err.severity, ErrorSeverity::Medium);
    assert!(err.recoverable);

    let retry = err.retry_policy().expect("network errors suggest a retry");
    assert_eq!(retry.max_attempts, 3);
    assert_eq!(retry.delay_ms, 1000);
}

#[test]
fn recoverable_categories_offer_automatic_retry() {
    let samples = [
        ("ETIMEDOUT", ErrorCategory::Network),
        ("429 Too Many Requests", ErrorCategory::ExternalService),
        ("out of memory", ErrorCategory::System),
    ];
    for (raw, category) in samples {
        let err = classify(raw, ErrorContext::new());
        assert_eq!(err.category, category);
        assert!(err.recoverable);
        let retry = err.retry_policy().unwrap();
        assert!(retry.max_attempts > 0);
    }
}

#[test]
fn non_recoverable_categories_are_manual_only() {
    for raw in ["malformed request body", "api key not configured"] {
        let err = classify(raw, ErrorContext::new());
        assert!(!err.recoverable, "{raw}");
        assert!(
            err.suggested_actions
                .iter()
                .all(|a| matches!(a, RecoveryAction::Manual { .. })),
            "{raw}"
        );
    }
}
