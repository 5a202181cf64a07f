//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conduit_agent::{
    AgentError, Attachment, ChatResponse, ChatStream, EngineConfig, ImageStore, LlmClient,
    Message, Result, StreamChunk, ToolCall, ToolContext, ToolDefinition, ToolRegistry,
};
use serde_json::{Value, json};

// ── LLM ───────────────────────────────────────────────────────────────────────

pub enum Reply {
    Respond(ChatResponse),
    Fail(String),
}

/// Replays a fixed list of replies.  Once exhausted it keeps answering "done".
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<Vec<Message>>>,
    repeat_tool_call: Option<ToolCall>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// A model that requests the same tool call forever.
    pub fn looping(call: ToolCall) -> Self {
        Self {
            repeat_tool_call: Some(call),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// The conversation sent on the most recent call.
    pub fn last_messages(&self) -> Vec<Message> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn next(&self, messages: &[Message]) -> Result<ChatResponse> {
        self.seen.lock().unwrap().push(messages.to_vec());
        if let Some(call) = &self.repeat_tool_call {
            let mut call = call.clone();
            call.id = format!("call_{}", self.calls());
            return Ok(ChatResponse::tool_calls(vec![call]));
        }
        match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(reason)) => Err(AgentError::LlmRequestFailed { reason }),
            None => Ok(ChatResponse::text("done")),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(
        &self,
        messages: &[Message],
        _model: Option<&str>,
        _tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        self.next(messages)
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        _model: Option<&str>,
        _tools: &[ToolDefinition],
    ) -> Result<ChatStream> {
        let response = self.next(messages)?;
        let mut chunks: Vec<Result<StreamChunk>> = Vec::new();
        if let Some(thinking) = response.thinking {
            chunks.push(Ok(StreamChunk::Thinking(thinking)));
        }
        for word in response.content.split_inclusive(' ') {
            chunks.push(Ok(StreamChunk::Text(word.to_owned())));
        }
        for call in response.tool_calls {
            chunks.push(Ok(StreamChunk::ToolCall(call)));
        }
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

pub fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.to_owned(),
        name: name.to_owned(),
        arguments,
    }
}

pub fn respond_tools(calls: Vec<ToolCall>) -> Reply {
    Reply::Respond(ChatResponse::tool_calls(calls))
}

pub fn respond_text(text: &str) -> Reply {
    Reply::Respond(ChatResponse::text(text))
}

// ── Tools ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum Behavior {
    Return(Value),
    Fail(String),
    SleepThen(Duration, Value),
}

/// A registry with canned behaviour per tool name.
#[derive(Default)]
pub struct FakeTools {
    behaviors: HashMap<String, Behavior>,
    executed: Mutex<Vec<(String, Value)>>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(name.to_owned(), behavior);
        self
    }

    pub fn executed(&self) -> Vec<(String, Value)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_names(&self) -> Vec<String> {
        self.executed().into_iter().map(|(name, _)| name).collect()
    }
}

#[async_trait]
impl ToolRegistry for FakeTools {
    fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut names: Vec<_> = self.behaviors.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| ToolDefinition {
                description: format!("{name} tool"),
                name,
                parameters_schema: json!({"type": "object"}),
            })
            .collect()
    }

    async fn execute_tool(&self, name: &str, arguments: Value, _ctx: &ToolContext) -> Result<Value> {
        let behavior = self
            .behaviors
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownTool {
                tool_name: name.to_owned(),
            })?;
        self.executed
            .lock()
            .unwrap()
            .push((name.to_owned(), arguments));
        match behavior {
            Behavior::Return(value) => Ok(value),
            Behavior::Fail(reason) => Err(AgentError::ToolExecutionFailed {
                tool_name: name.to_owned(),
                reason,
            }),
            Behavior::SleepThen(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
        }
    }
}

// ── Image store ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryImageStore {
    pub stored: Mutex<Vec<(Vec<u8>, String)>>,
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn persist_image(&self, bytes: Vec<u8>, mime_type: &str) -> Result<Attachment> {
        let mut stored = self.stored.lock().unwrap();
        stored.push((bytes.clone(), mime_type.to_owned()));
        let name = format!("image-{}.png", stored.len());
        Ok(Attachment::new(name.clone(), format!("/uploads/{name}"), mime_type)
            .with_size(bytes.len() as u64))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

pub fn config() -> EngineConfig {
    EngineConfig::default()
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}

/// Yield until the engine has an outstanding permission request.
pub async fn wait_for_pending(engine: &conduit_agent::Engine) -> conduit_agent::PermissionRequest {
    for _ in 0..1_000 {
        if let Some(request) = engine.pending_permissions().into_iter().next() {
            return request;
        }
        tokio::task::yield_now().await;
    }
    panic!("no permission request appeared");
}
