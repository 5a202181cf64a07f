//! The external streaming protocol.
//!
//! Internal [`AgentEvent`]s are re-emitted as [`StreamEvent`]s, a flat JSON
//! shape that UIs consume:
//!
//! ```json
//! {"type": "tool_start", "tool": "bash", "toolId": "call_1", "args": {"command": "ls"}}
//! ```
//!
//! Every run ends with exactly one `complete` or `error` event.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::attachments::Attachment;
use crate::runtime::AgentEvent;

/// Discriminant of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Text,
    Thinking,
    ToolStart,
    ToolResult,
    Permission,
    Complete,
    Error,
}

/// One event of the external protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Only on `complete` and `error`, and only when non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

impl StreamEvent {
    fn new(kind: StreamEventType) -> Self {
        Self {
            kind,
            content: None,
            tool: None,
            tool_id: None,
            args: None,
            result: None,
            attachments: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StreamEventType::Complete | StreamEventType::Error)
    }
}

fn non_empty(attachments: Vec<Attachment>) -> Option<Vec<Attachment>> {
    (!attachments.is_empty()).then_some(attachments)
}

impl From<AgentEvent> for StreamEvent {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::TextDelta(text) => Self {
                content: Some(text),
                ..Self::new(StreamEventType::Text)
            },
            AgentEvent::Thinking(text) => Self {
                content: Some(text),
                ..Self::new(StreamEventType::Thinking)
            },
            AgentEvent::ToolStarted { id, name, arguments } => Self {
                tool: Some(name),
                tool_id: Some(id),
                args: Some(arguments),
                ..Self::new(StreamEventType::ToolStart)
            },
            AgentEvent::ToolFinished {
                id,
                name,
                result,
                is_error,
            } => Self {
                tool: Some(name),
                tool_id: Some(id),
                result: Some(result),
                content: is_error.then(|| "error".to_owned()),
                ..Self::new(StreamEventType::ToolResult)
            },
            AgentEvent::PermissionRequired(request) => Self {
                content: request.reason.clone(),
                tool: Some(request.tool_name.clone()),
                args: Some(request.tool_input.clone()),
                result: serde_json::to_value(&request).ok(),
                ..Self::new(StreamEventType::Permission)
            },
            AgentEvent::Completed(output) => Self {
                content: Some(output.text),
                attachments: non_empty(output.attachments),
                ..Self::new(StreamEventType::Complete)
            },
            AgentEvent::Failed(failure) => {
                let failure = *failure;
                Self {
                    content: Some(failure.classified.message.clone()),
                    result: serde_json::to_value(&failure.classified).ok(),
                    attachments: non_empty(failure.attachments),
                    ..Self::new(StreamEventType::Error)
                }
            }
        }
    }
}

/// The event stream of one run.
///
/// Yields [`StreamEvent`]s; use [`EventStream::into_agent_events`] to see the
/// richer internal events instead.  Dropping the stream cancels the run.
pub struct EventStream {
    rx: ReceiverStream<AgentEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self {
            rx: ReceiverStream::new(rx),
        }
    }

    pub fn into_agent_events(self) -> ReceiverStream<AgentEvent> {
        self.rx
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(StreamEvent::from))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
