//! Agent error types.
//!
//! All engine subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure.

use conduit_reliability::{ErrorCategory, ReliabilityError};

/// Unified error type for the agent engine.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- LLM errors ----------------------------------------------------------
    /// A request to the LLM provider failed.
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    /// The incremental response stream was interrupted or produced invalid data.
    #[error("llm stream error: {reason}")]
    LlmStreamError { reason: String },

    // -- Tool errors ---------------------------------------------------------
    /// A tool call referenced a tool that no adapter exposes.
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    /// A tool invocation failed.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    /// Persisting an inline image returned by a tool failed.
    #[error("attachment storage failed: {reason}")]
    AttachmentStorage { reason: String },

    // -- Run control ---------------------------------------------------------
    /// The run was cancelled by the caller.
    #[error("run aborted")]
    Aborted,

    /// The permission broker was disposed while a request was outstanding.
    #[error("permission broker closed")]
    PermissionBrokerClosed,

    // -- Configuration -------------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Upstream crate errors -----------------------------------------------
    /// An error from the reliability layer, including breaker rejections.
    #[error(transparent)]
    Reliability(#[from] ReliabilityError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Returns `true` when the operation was rejected by an open circuit
    /// rather than attempted.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Reliability(e) if e.is_circuit_open())
    }

    /// The category of the open circuit, if this is a breaker rejection.
    pub fn open_circuit(&self) -> Option<ErrorCategory> {
        match self {
            Self::Reliability(ReliabilityError::CircuitOpen { category }) => Some(*category),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;
