//! Tool registry collaborator interface.
//!
//! The loop sees tools only through [`ToolRegistry`].  Hosts that organise
//! tools as several adapters (filesystem, browser, mail, ...) can implement
//! [`ToolAdapter`] for each and combine them with [`AdapterRegistry`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::attachments::Attachment;
use crate::error::{AgentError, Result};
use crate::llm::ToolDefinition;

/// Per-run information handed to every tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The run issuing the call.
    pub run_id: Uuid,

    /// Working directory for tools that touch the filesystem.
    pub cwd: Option<PathBuf>,
}

/// The registry of tools the model may invoke.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// All tools currently available.
    fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Execute a named tool.  Errors are folded back into the conversation by
    /// the loop; they never abort a run.
    async fn execute_tool(&self, name: &str, arguments: Value, ctx: &ToolContext)
    -> Result<Value>;
}

/// A group of related tools exposed by one adapter.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// The unique identifier for this adapter.
    fn adapter_id(&self) -> &str;

    /// Returns the tool definitions this adapter exposes to the LLM.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Execute a named tool with the given arguments.
    async fn execute(&self, tool_name: &str, arguments: Value, ctx: &ToolContext)
    -> Result<Value>;
}

/// A [`ToolRegistry`] backed by a list of [`ToolAdapter`]s.
///
/// When two adapters expose the same tool name the first registered wins.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<Arc<dyn ToolAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        tracing::debug!(adapter_id = adapter.adapter_id(), "tool adapter registered");
        self.adapters.push(adapter);
    }

    /// Find the adapter that owns a given tool name.
    fn find_adapter_for_tool(&self, tool_name: &str) -> Option<&Arc<dyn ToolAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.tool_definitions().iter().any(|td| td.name == tool_name))
    }
}

#[async_trait]
impl ToolRegistry for AdapterRegistry {
    fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut seen = std::collections::HashSet::new();
        self.adapters
            .iter()
            .flat_map(|a| a.tool_definitions())
            .filter(|td| seen.insert(td.name.clone()))
            .collect()
    }

    async fn execute_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: &ToolContext,
    ) -> Result<Value> {
        let adapter = self
            .find_adapter_for_tool(name)
            .ok_or_else(|| AgentError::UnknownTool {
                tool_name: name.to_owned(),
            })?;
        adapter.execute(name, arguments, ctx).await
    }
}

/// Storage for inline images returned by tools.
///
/// The engine decodes the base64 payload and hands the raw bytes over; the
/// store returns the attachment record the UI should display.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn persist_image(&self, bytes: Vec<u8>, mime_type: &str) -> Result<Attachment>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
