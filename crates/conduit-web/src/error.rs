//! HTTP error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use conduit_agent::{AgentError, RunFailure};
use serde_json::json;

/// Errors returned by REST handlers, rendered as JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("permission request `{0}` is unknown or already resolved")]
    UnknownPermission(String),

    #[error(transparent)]
    Run(Box<RunFailure>),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl From<Box<RunFailure>> for ApiError {
    fn from(failure: Box<RunFailure>) -> Self {
        Self::Run(failure)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownPermission(_) => StatusCode::NOT_FOUND,
            Self::Run(failure) if failure.error.is_circuit_open() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Run(failure) if failure.is_aborted() => StatusCode::REQUEST_TIMEOUT,
            Self::Run(_) => StatusCode::BAD_GATEWAY,
            Self::Agent(AgentError::ConfigError { .. }) => StatusCode::BAD_REQUEST,
            Self::Agent(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Run(failure) => json!({
                "error": failure.classified.message,
                "runId": failure.run_id,
                "category": failure.classified.category,
                "severity": failure.classified.severity,
                "recoverable": failure.classified.recoverable,
                "suggestedActions": failure.classified.suggested_actions,
                "attachments": failure.attachments,
            }),
            other => json!({ "error": other.to_string() }),
        };
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(body)).into_response()
    }
}
