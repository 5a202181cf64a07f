//! REST API route handlers.
//!
//! Provides endpoints for one-shot (non-streaming) chat, approval of pending
//! tool calls, and engine status including circuit breaker state.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use conduit_agent::{ApprovalMode, Engine, Message, PermissionRequest, RunConfig, RunOutput, RunRequest};
use conduit_reliability::{CircuitSnapshot, ErrorCategory};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run overrides
// ---------------------------------------------------------------------------

/// Per-request settings layered over the engine's `[agent]` defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOverrides {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_iterations: Option<u32>,
    pub approval_mode: Option<ApprovalMode>,
}

impl RunOverrides {
    pub fn apply(self, mut base: RunConfig) -> RunConfig {
        if let Some(model) = self.model {
            base.model = Some(model);
        }
        if let Some(prompt) = self.system_prompt {
            base.system_prompt = Some(prompt);
        }
        if let Some(max) = self.max_iterations {
            base.max_iterations = max;
        }
        if let Some(mode) = self.approval_mode {
            base.approval_mode = mode;
        }
        base
    }
}

/// Build a run request from a message and optional overrides.
pub fn build_request(
    engine: &Engine,
    message: String,
    history: Vec<Message>,
    overrides: Option<RunOverrides>,
) -> RunRequest {
    let config = overrides
        .unwrap_or_default()
        .apply(engine.config().agent.clone());
    RunRequest::new(message)
        .with_history(history)
        .with_config(config)
}

// ---------------------------------------------------------------------------
// GET /api/status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub pending_permissions: usize,
    pub circuits: Vec<CircuitSnapshot>,
}

/// Engine health: `degraded` while any circuit is not closed.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let circuits = state.engine.breaker().snapshot_all();
    let degraded = circuits
        .iter()
        .any(|c| c.status != conduit_reliability::CircuitStatus::Closed);

    Json(StatusResponse {
        status: if degraded { "degraded" } else { "healthy" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        pending_permissions: state.engine.broker().pending_count(),
        circuits,
    })
}

// ---------------------------------------------------------------------------
// POST /api/chat
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub config: Option<RunOverrides>,
}

/// Run the full tool-calling loop and return its output.
///
/// Approval requests raised during the run must be answered through
/// `POST /api/permissions/{id}` while this request is in flight.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<Json<RunOutput>, ApiError> {
    if body.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }

    let request = build_request(&state.engine, body.message, body.history, body.config);
    let output = state.engine.run(request, CancellationToken::new()).await?;
    Ok(Json(output))
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// `GET /api/permissions`: outstanding approval requests, oldest first.
pub async fn list_permissions(State(state): State<Arc<AppState>>) -> Json<Vec<PermissionRequest>> {
    Json(state.engine.pending_permissions())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionBody {
    pub approved: bool,
    #[serde(default)]
    pub updated_input: Option<Value>,
}

#[derive(Serialize)]
pub struct Resolved {
    pub resolved: bool,
}

/// `POST /api/permissions/{id}`: approve or deny a pending request.
pub async fn respond_permission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PermissionBody>,
) -> Result<Json<Resolved>, ApiError> {
    if state
        .engine
        .respond_permission(&id, body.approved, body.updated_input)
    {
        Ok(Json(Resolved { resolved: true }))
    } else {
        Err(ApiError::UnknownPermission(id))
    }
}

// ---------------------------------------------------------------------------
// POST /api/circuits/reset
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ResetParams {
    pub category: Option<ErrorCategory>,
}

/// Reset one circuit (`?category=NETWORK`) or all of them.
pub async fn reset_circuits(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ResetParams>,
) -> Json<Vec<CircuitSnapshot>> {
    let breaker = state.engine.breaker();
    match params.category {
        Some(category) => breaker.reset(category),
        None => breaker.reset_all(),
    }
    tracing::info!(category = ?params.category, "circuits reset");
    Json(breaker.snapshot_all())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
