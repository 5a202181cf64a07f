//! Per-category circuit breaker.
//!
//! Each [`ErrorCategory`] owns an independent state machine:
//!
//! ```text
//!            failures >= failure_threshold
//!   CLOSED ─────────────────────────────────> OPEN
//!     ^                                        │  now - last_failure >= reset_timeout
//!     │ successes >= success_threshold         │  (observed lazily by should_reject)
//!     │                                        v
//!     └──────────────── HALF_OPEN <────────────┘
//!                           │ any failure
//!                           └──────────────> OPEN
//! ```
//!
//! State lives in a [`DashMap`] keyed by category.  Every transition happens
//! while holding that category's shard lock, so concurrent runs never observe
//! a half-applied update.  There are no timers: the OPEN → HALF_OPEN move is
//! evaluated on the next [`CircuitBreaker::should_reject`] call.
//!
//! Time is read from [`tokio::time::Instant`] so tests can drive it with a
//! paused clock.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::classifier::ErrorCategory;
use crate::error::ReliabilityError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Thresholds shared by every category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens.
    pub failure_threshold: u32,

    /// Successes in HALF_OPEN before the circuit closes again.
    pub success_threshold: u32,

    /// How long the circuit stays OPEN after the last failure.
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 60_000,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Status of a single circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    /// Normal operation; failures are counted.
    #[default]
    Closed,
    /// Calls are rejected.
    Open,
    /// Trial calls are allowed; one failure reopens.
    HalfOpen,
}

/// Mutable state of one category's circuit.
#[derive(Debug, Clone, Default)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Instant>,
}

/// A serializable copy of a circuit's state, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub category: ErrorCategory,
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure, if any.
    pub since_last_failure_ms: Option<u64>,
}

impl CircuitSnapshot {
    fn of(category: ErrorCategory, state: &CircuitState) -> Self {
        Self {
            category,
            status: state.status,
            failure_count: state.failure_count,
            success_count: state.success_count,
            since_last_failure_ms: state
                .last_failure_time
                .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

/// Circuit breaker with one independent circuit per [`ErrorCategory`].
///
/// Share it behind an `Arc`; all methods take `&self`.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: DashMap<ErrorCategory, CircuitState>,
}

impl CircuitBreaker {
    /// Create a breaker with the given thresholds.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether the caller should skip an operation in `category`.
    ///
    /// Also advances OPEN to HALF_OPEN once the reset timeout has elapsed
    /// since the last failure; in that case `false` is returned.
    pub fn should_reject(&self, category: ErrorCategory) -> bool {
        let mut state = self.states.entry(category).or_default();
        match state.status {
            CircuitStatus::Closed | CircuitStatus::HalfOpen => false,
            CircuitStatus::Open => {
                let cooled_down = state
                    .last_failure_time
                    .is_none_or(|t| t.elapsed() >= self.config.reset_timeout());
                if cooled_down {
                    state.status = CircuitStatus::HalfOpen;
                    state.success_count = 0;
                    tracing::info!(category = %category, "circuit half-open");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Record a successful operation in `category`.
    pub fn record_success(&self, category: ErrorCategory) {
        let mut state = self.states.entry(category).or_default();
        match state.status {
            CircuitStatus::Closed => {
                state.failure_count = 0;
            }
            CircuitStatus::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.status = CircuitStatus::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    tracing::info!(category = %category, "circuit closed");
                }
            }
            CircuitStatus::Open => {
                tracing::debug!(category = %category, "success recorded while circuit open, ignored");
            }
        }
    }

    /// Record a failed operation in `category`.
    pub fn record_failure(&self, category: ErrorCategory) {
        let mut state = self.states.entry(category).or_default();
        state.last_failure_time = Some(Instant::now());
        match state.status {
            CircuitStatus::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.status = CircuitStatus::Open;
                    tracing::warn!(
                        category = %category,
                        failures = state.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.success_count = 0;
                tracing::warn!(category = %category, "trial call failed, circuit reopened");
            }
            CircuitStatus::Open => {
                state.failure_count += 1;
            }
        }
    }

    /// Forget the state of one category.
    pub fn reset(&self, category: ErrorCategory) {
        if self.states.remove(&category).is_some() {
            tracing::info!(category = %category, "circuit reset");
        }
    }

    /// Forget the state of every category.
    pub fn reset_all(&self) {
        self.states.clear();
        tracing::info!("all circuits reset");
    }

    /// Current status of `category` without advancing the state machine.
    pub fn status(&self, category: ErrorCategory) -> CircuitStatus {
        self.states
            .get(&category)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// A copy of one category's state, if it has been observed.
    pub fn snapshot(&self, category: ErrorCategory) -> Option<CircuitSnapshot> {
        self.states
            .get(&category)
            .map(|s| CircuitSnapshot::of(category, s.value()))
    }

    /// Copies of every observed category's state, ordered by category.
    pub fn snapshot_all(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self
            .states
            .iter()
            .map(|entry| CircuitSnapshot::of(*entry.key(), entry.value()))
            .collect();
        all.sort_by_key(|s| s.category);
        all
    }

    /// Run `operation` under the breaker for `category`.
    ///
    /// When the circuit rejects, the operation is never polled and
    /// [`ReliabilityError::CircuitOpen`] is returned through `E`.  Otherwise
    /// the outcome is recorded against `category`.
    pub async fn guard<T, E, F>(&self, category: ErrorCategory, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<ReliabilityError>,
    {
        if self.should_reject(category) {
            tracing::debug!(category = %category, "operation rejected by open circuit");
            return Err(ReliabilityError::CircuitOpen { category }.into());
        }

        let result = operation.await;
        match &result {
            Ok(_) => self.record_success(category),
            Err(_) => self.record_failure(category),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
