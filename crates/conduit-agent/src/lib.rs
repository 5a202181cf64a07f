//! Agent orchestration engine for conduit.
//!
//! This crate runs the conversation between a language model and a registry
//! of tools: it asks the model, executes the tools it requests (pausing for
//! human approval where policy demands), feeds bounded results back, and
//! reports progress as a stream of events.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐    ┌──────────────────┐    ┌─────────────┐
//! │  Stream   │<───│ Tool-calling loop│───>│ LlmClient   │
//! │ (events)  │    │    (runtime)     │    └─────────────┘
//! └───────────┘    └──┬─────────┬─────┘    ┌─────────────┐
//!                     │         └─────────>│ToolRegistry │
//!          ┌──────────┴───┐  ┌──────────┐  └─────────────┘
//!          │ Permission   │  │ Circuit  │
//!          │   broker     │  │ breaker  │
//!          └──────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`runtime`] -- The [`Engine`] and its tool-calling loop.
//! - [`stream`] -- The external event protocol.
//! - [`permission`] -- Approval policy and the permission broker.
//! - [`truncate`] -- Bounding tool output fed back to the model.
//! - [`attachments`] -- Extracting and deduplicating files surfaced by tools.
//! - [`llm`] -- LLM client interface and conversation types.
//! - [`tools`] -- Tool registry interface.
//! - [`config`] -- Engine configuration.
//! - [`error`] -- Agent error types.

pub mod attachments;
pub mod config;
pub mod error;
pub mod llm;
pub mod permission;
pub mod runtime;
pub mod stream;
pub mod tools;
pub mod truncate;

// Re-export the most commonly used types at the crate root.
pub use attachments::{Attachment, AttachmentCollector, extract_attachments};
pub use config::{EngineConfig, PermissionConfig, RunConfig, StreamConfig};
pub use error::{AgentError, Result};
pub use llm::{
    ChatResponse, ChatStream, LlmClient, Message, Role, StreamChunk, ToolCall, ToolDefinition,
};
pub use permission::{
    ApprovalMode, DecisionOutcome, PermissionBroker, PermissionDecision, PermissionRequest,
};
pub use runtime::{
    AgentEvent, Engine, MODEL_CIRCUITS, RunFailure, RunOutput, RunRequest, ToolInvocation,
};
pub use stream::{EventStream, StreamEvent, StreamEventType};
pub use tools::{AdapterRegistry, ImageStore, ToolAdapter, ToolContext, ToolRegistry};
pub use truncate::{MAX_TOOL_OUTPUT_CHARS, truncate_tool_output};

pub use tokio_util::sync::CancellationToken;
