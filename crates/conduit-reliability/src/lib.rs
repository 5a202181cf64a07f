//! Reliability layer for the conduit agent engine.
//!
//! This crate decides what happens when something fails:
//!
//! - **[`classifier`]** -- Maps a raw failure plus contextual metadata to a
//!   [`ClassifiedError`] (category, severity, recoverability, suggested
//!   recovery actions).  Pattern tables are compiled once into
//!   [`aho_corasick`] automata.
//! - **[`breaker`]** -- Per-category circuit breaker backed by [`DashMap`]
//!   so concurrent runs never observe a torn state for a given category.
//! - **[`retry`]** -- Executes the automatic retry policy a classified error
//!   suggests, for callers that choose to act on it.
//! - **[`error`]** -- The crate's error type, including the distinguishable
//!   "circuit open" rejection.
//!
//! All public types are `Send + Sync`.
//!
//! [`DashMap`]: dashmap::DashMap

pub mod breaker;
pub mod classifier;
pub mod error;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState, CircuitStatus};
pub use classifier::{
    Backoff, COMPONENT_LLM, COMPONENT_TOOL_LOOP, ClassifiedError, ErrorCategory, ErrorContext,
    ErrorSeverity, RecoveryAction, RetryPolicy, classify,
};
pub use error::{ReliabilityError, Result};
pub use retry::run_with_recovery;
