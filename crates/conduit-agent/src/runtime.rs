//! The tool-calling loop.
//!
//! A run alternates between asking the model and executing the tools it
//! requests until the model answers without tool calls, the iteration cap is
//! reached, or the caller cancels.
//!
//! ```text
//! AwaitingModel --(no tool calls)--> Done
//! AwaitingModel --(tool calls)-----> ExecutingTools --> AwaitingModel
//! AwaitingModel --(cap reached)----> Done (partial)
//! any           --(cancelled)------> Aborted
//! ```
//!
//! Tool failures never end a run; they are folded back into the transcript as
//! `Error: ...` tool messages.  Model failures and open circuits end it.

use std::sync::Arc;
use std::time::Instant;

use conduit_reliability::{
    COMPONENT_LLM, COMPONENT_TOOL_LOOP, CircuitBreaker, ClassifiedError, ErrorCategory,
    ErrorContext, ReliabilityError, classify,
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::attachments::{Attachment, AttachmentCollector, extract_attachments, inline_image};
use crate::config::{EngineConfig, RunConfig};
use crate::error::{AgentError, Result};
use crate::llm::{ChatResponse, LlmClient, Message, StreamChunk, ToolCall, ToolDefinition};
use crate::permission::{self, DecisionOutcome, PermissionBroker, PermissionRequest};
use crate::stream::EventStream;
use crate::tools::{ImageStore, ToolContext, ToolRegistry};
use crate::truncate::{model_view, preview, truncate_tool_output};

/// Circuits consulted before every model call.
pub const MODEL_CIRCUITS: [ErrorCategory; 2] = [ErrorCategory::Network, ErrorCategory::ExternalService];

/// Characters of each tool result included in logs.
const LOG_PREVIEW_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// Input for one run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub message: String,

    /// Prior conversation, oldest first.
    pub history: Vec<Message>,

    /// Per-run settings.  Falls back to the engine's `[agent]` section.
    pub config: Option<RunConfig>,
}

impl RunRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// One executed (or refused) tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: Value,
    pub is_error: bool,
    pub duration_ms: u64,
}

/// The outcome of a run that reached `Done`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub run_id: Uuid,

    /// The last text the model produced.
    pub text: String,

    pub invocations: Vec<ToolInvocation>,
    pub attachments: Vec<Attachment>,

    /// The full transcript, including the new user message.
    pub messages: Vec<Message>,

    /// Model calls made.
    pub iterations: u32,

    /// Whether the run stopped at the iteration cap rather than on a final
    /// answer.
    pub limit_reached: bool,
}

/// A run that ended with an error or was aborted.
#[derive(Debug, thiserror::Error)]
#[error("run {run_id} failed: {classified}")]
pub struct RunFailure {
    pub run_id: Uuid,
    #[source]
    pub error: AgentError,
    pub classified: ClassifiedError,
    /// Attachments collected before the failure.
    pub attachments: Vec<Attachment>,
    pub iterations: u32,
}

impl RunFailure {
    pub fn is_aborted(&self) -> bool {
        matches!(self.error, AgentError::Aborted)
    }
}

/// Everything a streaming run reports, in order.
#[derive(Debug)]
pub enum AgentEvent {
    TextDelta(String),
    Thinking(String),
    ToolStarted {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolFinished {
        id: String,
        name: String,
        result: Value,
        is_error: bool,
    },
    PermissionRequired(PermissionRequest),
    Completed(Box<RunOutput>),
    Failed(Box<RunFailure>),
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The orchestration engine.  Cheap to clone; clones share the permission
/// broker and the circuit breaker.
#[derive(Clone)]
pub struct Engine {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolRegistry>,
    images: Option<Arc<dyn ImageStore>>,
    broker: PermissionBroker,
    breaker: Arc<CircuitBreaker>,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("broker", &self.broker)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolRegistry>, config: EngineConfig) -> Self {
        Self {
            llm,
            tools,
            images: None,
            broker: PermissionBroker::new(config.permissions.timeout()),
            breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            config: Arc::new(config),
        }
    }

    /// Persist inline images returned by tools through `store`.
    pub fn with_image_store(mut self, store: Arc<dyn ImageStore>) -> Self {
        self.images = Some(store);
        self
    }

    /// Share a circuit breaker with other components.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn broker(&self) -> &PermissionBroker {
        &self.broker
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Outstanding approval requests across all runs.
    pub fn pending_permissions(&self) -> Vec<PermissionRequest> {
        self.broker.pending()
    }

    /// Answer an approval request.  `false` if the id is unknown or already
    /// resolved.
    pub fn respond_permission(&self, request_id: &str, approved: bool, updated_input: Option<Value>) -> bool {
        self.broker.respond(request_id, approved, updated_input)
    }

    /// Deny every outstanding approval request.  Runs waiting on one continue
    /// with a tool error.
    pub fn shutdown(&self) {
        tracing::info!(pending = self.broker.pending_count(), "engine shutting down");
        self.broker.dispose();
    }

    /// Drive a run to completion using blocking model calls.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<RunOutput, Box<RunFailure>> {
        Run::new(self, request, cancel, None).drive().await
    }

    /// Start a run using incremental model calls and return its events.
    ///
    /// The stream ends with exactly one `complete` or `error` event.  Dropping
    /// it cancels the run.
    pub fn stream(&self, request: RunRequest, cancel: CancellationToken) -> EventStream {
        let (tx, rx) = mpsc::channel(self.config.stream.channel_capacity.max(1));
        let engine = self.clone();

        tokio::spawn(async move {
            let run = Run::new(&engine, request, cancel, Some(tx.clone()));
            let terminal = match run.drive().await {
                Ok(output) => AgentEvent::Completed(Box::new(output)),
                Err(failure) => AgentEvent::Failed(failure),
            };
            if tx.send(terminal).await.is_err() {
                tracing::debug!("event consumer gone before the terminal event");
            }
        });

        EventStream::new(rx)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// A failure that ends the current run, already classified.
struct Interrupted {
    error: AgentError,
    classified: ClassifiedError,
}

impl Interrupted {
    fn new(error: AgentError, context: ErrorContext) -> Self {
        let classified = classify(error.to_string(), context);
        Self { error, classified }
    }
}

/// Whether a gated call may run, and with which arguments.
enum Authorization {
    Proceed(Value),
    Refused(String),
}

/// State owned by one run.  Never shared between runs.
struct Run<'a> {
    engine: &'a Engine,
    run_id: Uuid,
    config: RunConfig,
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    invocations: Vec<ToolInvocation>,
    attachments: AttachmentCollector,
    iterations: u32,
    last_text: String,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<AgentEvent>>,
    ctx: ToolContext,
}

impl<'a> Run<'a> {
    fn new(
        engine: &'a Engine,
        request: RunRequest,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Self {
        let run_id = Uuid::now_v7();
        let config = request
            .config
            .unwrap_or_else(|| engine.config.agent.clone());

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if let Some(prompt) = config.effective_system_prompt() {
            messages.push(Message::system(prompt));
        }
        messages.extend(request.history);
        messages.push(Message::user(request.message));

        let ctx = ToolContext {
            run_id,
            cwd: config.cwd.clone(),
        };

        Self {
            engine,
            run_id,
            tools: engine.tools.list_tools(),
            config,
            messages,
            invocations: Vec::new(),
            attachments: AttachmentCollector::new(),
            iterations: 0,
            last_text: String::new(),
            cancel,
            events,
            ctx,
        }
    }

    fn streaming(&self) -> bool {
        self.events.is_some()
    }

    async fn drive(mut self) -> std::result::Result<RunOutput, Box<RunFailure>> {
        tracing::info!(
            run_id = %self.run_id,
            model = self.config.model.as_deref().unwrap_or("default"),
            max_iterations = self.config.max_iterations,
            approval_mode = %self.config.approval_mode,
            tool_count = self.tools.len(),
            streaming = self.streaming(),
            "run started"
        );

        match self.rounds().await {
            Ok(limit_reached) => Ok(self.finish(limit_reached)),
            Err(interrupted) => Err(self.fail(interrupted)),
        }
    }

    /// Run model/tool rounds.  Returns whether the iteration cap stopped the
    /// run.
    async fn rounds(&mut self) -> std::result::Result<bool, Interrupted> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.aborted());
            }

            let max = self.config.max_iterations;
            if max > 0 && self.iterations >= max {
                tracing::warn!(run_id = %self.run_id, max_iterations = max, "iteration limit reached");
                return Ok(true);
            }
            self.iterations += 1;
            tracing::debug!(run_id = %self.run_id, iteration = self.iterations, "awaiting model");

            let response = self.call_model().await?;
            if !response.content.is_empty() {
                self.last_text.clone_from(&response.content);
            }

            if response.tool_calls.is_empty() {
                self.messages.push(Message::assistant(response.content));
                return Ok(false);
            }

            let calls: Vec<ToolCall> = response
                .tool_calls
                .into_iter()
                .map(|mut call| {
                    if call.id.is_empty() {
                        call.id = format!("call_{}", Uuid::now_v7().simple());
                    }
                    call
                })
                .collect();

            tracing::info!(
                run_id = %self.run_id,
                iteration = self.iterations,
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "model requested tool calls"
            );

            self.messages
                .push(Message::assistant_tool_calls(response.content, calls.clone()));

            for call in calls {
                if self.cancel.is_cancelled() {
                    return Err(self.aborted());
                }
                self.execute_call(call).await?;
            }
        }
    }

    // -- Model ---------------------------------------------------------------

    async fn call_model(&mut self) -> std::result::Result<ChatResponse, Interrupted> {
        let breaker = Arc::clone(&self.engine.breaker);

        if let Some(category) = MODEL_CIRCUITS.into_iter().find(|c| breaker.should_reject(*c)) {
            tracing::warn!(run_id = %self.run_id, category = %category, "model call rejected by open circuit");
            return Err(Interrupted::new(
                ReliabilityError::CircuitOpen { category }.into(),
                ErrorContext::component(COMPONENT_LLM).with_category(category),
            ));
        }

        let outcome = tokio::select! {
            _ = self.stopped() => None,
            response = self.request_model() => Some(response),
        };
        let Some(outcome) = outcome else {
            return Err(self.aborted());
        };

        match outcome {
            Ok(response) => {
                for category in MODEL_CIRCUITS {
                    breaker.record_success(category);
                }
                Ok(response)
            }
            Err(error) => {
                let operation = if self.streaming() { "stream_chat" } else { "chat" };
                let interrupted = Interrupted::new(
                    error,
                    ErrorContext::component(COMPONENT_LLM)
                        .with_operation(operation)
                        .with_metadata("run_id", self.run_id.to_string()),
                );
                let category = interrupted.classified.category;
                if MODEL_CIRCUITS.contains(&category) {
                    breaker.record_failure(category);
                }
                tracing::warn!(
                    run_id = %self.run_id,
                    category = %category,
                    error = %interrupted.error,
                    "model call failed"
                );
                Err(interrupted)
            }
        }
    }

    async fn request_model(&self) -> Result<ChatResponse> {
        let model = self.config.model.as_deref();

        if !self.streaming() {
            return self.engine.llm.chat(&self.messages, model, &self.tools).await;
        }

        let mut stream = self
            .engine
            .llm
            .stream_chat(&self.messages, model, &self.tools)
            .await?;

        let mut response = ChatResponse::default();
        let mut thinking = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Text(text) => {
                    response.content.push_str(&text);
                    self.emit(AgentEvent::TextDelta(text)).await;
                }
                StreamChunk::Thinking(text) => {
                    thinking.push_str(&text);
                    self.emit(AgentEvent::Thinking(text)).await;
                }
                StreamChunk::ToolCall(call) if call.name.is_empty() => {
                    return Err(AgentError::LlmStreamError {
                        reason: format!("tool call `{}` arrived without a tool name", call.id),
                    });
                }
                StreamChunk::ToolCall(call) => response.tool_calls.push(call),
            }
        }
        if !thinking.is_empty() {
            response.thinking = Some(thinking);
        }
        Ok(response)
    }

    // -- Tools ---------------------------------------------------------------

    async fn execute_call(&mut self, call: ToolCall) -> std::result::Result<(), Interrupted> {
        self.emit(AgentEvent::ToolStarted {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        })
        .await;

        let started = Instant::now();
        let outcome = match self.authorize(&call).await? {
            Authorization::Proceed(input) => {
                let executed = tokio::select! {
                    _ = self.stopped() => None,
                    result = self.engine.tools.execute_tool(&call.name, input, &self.ctx) => Some(result),
                };
                match executed {
                    Some(result) => result.map_err(|e| e.to_string()),
                    None => return Err(self.aborted()),
                }
            }
            Authorization::Refused(reason) => Err(reason),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (result, model_text, is_error) = match outcome {
            Ok(value) => {
                self.collect_attachments(&value).await;
                let text = truncate_tool_output(&model_view(&value));
                (value, text, false)
            }
            Err(reason) => {
                tracing::warn!(run_id = %self.run_id, tool = %call.name, error = %reason, "tool call failed");
                let text = format!("Error: {reason}");
                (Value::String(text.clone()), text, true)
            }
        };

        tracing::info!(
            run_id = %self.run_id,
            tool = %call.name,
            tool_id = %call.id,
            args = %call.arguments,
            duration_ms,
            is_error,
            preview = %preview(&model_text, LOG_PREVIEW_CHARS),
            "tool executed"
        );

        self.messages
            .push(Message::tool_result(&call.id, &call.name, model_text));
        self.invocations.push(ToolInvocation {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments,
            result: result.clone(),
            is_error,
            duration_ms,
        });
        self.emit(AgentEvent::ToolFinished {
            id: call.id,
            name: call.name,
            result,
            is_error,
        })
        .await;
        Ok(())
    }

    async fn authorize(&self, call: &ToolCall) -> std::result::Result<Authorization, Interrupted> {
        let Some(gate) = permission::evaluate(self.config.approval_mode, &call.name, &call.arguments) else {
            return Ok(Authorization::Proceed(call.arguments.clone()));
        };

        let (request, ticket) = match self
            .engine
            .broker
            .request(&call.name, call.arguments.clone(), gate)
        {
            Ok(pair) => pair,
            Err(e) => return Ok(Authorization::Refused(e.to_string())),
        };
        self.emit(AgentEvent::PermissionRequired(request)).await;
        tracing::debug!(run_id = %self.run_id, request_id = ticket.request_id(), tool = %call.name, "awaiting approval");

        // Dropping the ticket on the abort path withdraws the request.
        let decision = tokio::select! {
            _ = self.stopped() => None,
            decision = ticket.decision() => Some(decision),
        };
        let Some(decision) = decision else {
            return Err(self.aborted());
        };

        let name = &call.name;
        Ok(match decision.outcome {
            DecisionOutcome::Approved => Authorization::Proceed(decision.input),
            DecisionOutcome::Denied => Authorization::Refused(format!("permission denied for tool '{name}'")),
            DecisionOutcome::TimedOut => Authorization::Refused(format!("permission timed out for tool '{name}'")),
            DecisionOutcome::Disposed => Authorization::Refused(AgentError::PermissionBrokerClosed.to_string()),
        })
    }

    async fn collect_attachments(&mut self, value: &Value) {
        self.attachments.extend(extract_attachments(value));

        let image = match inline_image(value) {
            Ok(Some(image)) => image,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "ignoring undecodable inline image");
                return;
            }
        };
        let Some(store) = &self.engine.images else {
            tracing::debug!(run_id = %self.run_id, "inline image ignored, no image store configured");
            return;
        };
        match store.persist_image(image.bytes, &image.mime_type).await {
            Ok(attachment) => {
                self.attachments.push(attachment);
            }
            Err(e) => tracing::warn!(run_id = %self.run_id, error = %e, "failed to persist inline image"),
        }
    }

    // -- Events and outcomes -------------------------------------------------

    /// Resolves once the caller cancels or, for a streaming run, once the
    /// event consumer is gone.  The latter also cancels the run.
    async fn stopped(&self) {
        let consumer_gone = async {
            match &self.events {
                Some(tx) => tx.closed().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = consumer_gone => {
                tracing::debug!(run_id = %self.run_id, "event consumer dropped, cancelling run");
                self.cancel.cancel();
            }
        }
    }

    /// Send an event to the consumer.  A vanished consumer cancels the run.
    async fn emit(&self, event: AgentEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        if tx.send(event).await.is_err() && !self.cancel.is_cancelled() {
            tracing::debug!(run_id = %self.run_id, "event consumer dropped, cancelling run");
            self.cancel.cancel();
        }
    }

    fn aborted(&self) -> Interrupted {
        Interrupted::new(
            AgentError::Aborted,
            ErrorContext::component(COMPONENT_TOOL_LOOP).with_operation("run"),
        )
    }

    fn finish(self, limit_reached: bool) -> RunOutput {
        tracing::info!(
            run_id = %self.run_id,
            iterations = self.iterations,
            tool_calls = self.invocations.len(),
            attachments = self.attachments.len(),
            limit_reached,
            "run completed"
        );
        RunOutput {
            run_id: self.run_id,
            text: self.last_text,
            invocations: self.invocations,
            attachments: self.attachments.into_vec(),
            messages: self.messages,
            iterations: self.iterations,
            limit_reached,
        }
    }

    fn fail(self, interrupted: Interrupted) -> Box<RunFailure> {
        if matches!(interrupted.error, AgentError::Aborted) {
            tracing::info!(run_id = %self.run_id, iterations = self.iterations, "run aborted");
        } else {
            tracing::error!(
                run_id = %self.run_id,
                category = %interrupted.classified.category,
                severity = ?interrupted.classified.severity,
                error = %interrupted.error,
                "run failed"
            );
        }
        Box::new(RunFailure {
            run_id: self.run_id,
            error: interrupted.error,
            classified: interrupted.classified,
            attachments: self.attachments.into_vec(),
            iterations: self.iterations,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
