//! LLM collaborator interface.
//!
//! The engine never talks to a provider directly.  It consumes an
//! [`LlmClient`] implementation supplied by the host application:
//!
//! - [`LlmClient::chat`] -- blocking call returning a full [`ChatResponse`].
//! - [`LlmClient::stream_chat`] -- incremental call returning a finite,
//!   non-restartable [`ChatStream`] of [`StreamChunk`]s.

pub mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use types::{ChatResponse, Message, Role, StreamChunk, ToolCall, ToolDefinition};

/// A finite stream of response chunks.  Consumed once.
pub type ChatStream = BoxStream<'static, Result<StreamChunk>>;

/// The LLM provider client consumed by the tool-calling loop.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the conversation and wait for the complete response.
    async fn chat(
        &self,
        messages: &[Message],
        model: Option<&str>,
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse>;

    /// Send the conversation and receive the response incrementally.
    async fn stream_chat(
        &self,
        messages: &[Message],
        model: Option<&str>,
        tools: &[ToolDefinition],
    ) -> Result<ChatStream>;
}
