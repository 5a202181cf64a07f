//! Reliability error types.
//!
//! [`ReliabilityError::CircuitOpen`] means the breaker refused to run an
//! operation; every other variant means it ran and failed.

use crate::classifier::ErrorCategory;

/// Unified error type for the reliability layer.
#[derive(Debug, thiserror::Error)]
pub enum ReliabilityError {
    /// The circuit for `category` is open; the operation was not attempted.
    #[error("circuit open for category {category}")]
    CircuitOpen {
        /// The category whose circuit rejected the call.
        category: ErrorCategory,
    },

    /// Every attempt allowed by a retry policy failed.
    #[error("operation failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    /// The guarded operation itself failed.
    #[error("operation failed: {0}")]
    Operation(String),
}

impl ReliabilityError {
    /// Returns `true` when this error is a breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Convenience alias used throughout the reliability crate.
pub type Result<T> = std::result::Result<T, ReliabilityError>;
