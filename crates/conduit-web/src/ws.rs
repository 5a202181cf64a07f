//! WebSocket handler for streaming chat.
//!
//! Clients connect to `/ws` and exchange JSON messages.  Inbound messages
//! start a run, answer a permission request, or cancel the current run;
//! outbound messages are the engine's
//! [`StreamEvent`](conduit_agent::StreamEvent)s.
//!
//! ```json
//! {"type": "chat", "content": "tidy up /tmp", "config": {"approvalMode": "ask"}}
//! {"type": "permission_response", "requestId": "...", "approved": true}
//! {"type": "cancel"}
//! ```

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use conduit_agent::Message;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{RunOverrides, build_request};
use crate::state::AppState;

/// Outbound messages buffered per connection.
const OUTBOUND_CAPACITY: usize = 128;

// ---------------------------------------------------------------------------
// WebSocket message types
// ---------------------------------------------------------------------------

/// Inbound message from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Chat {
        content: String,
        #[serde(default)]
        history: Vec<Message>,
        #[serde(default)]
        config: Option<RunOverrides>,
    },
    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        request_id: String,
        approved: bool,
        #[serde(default)]
        updated_input: Option<Value>,
    },
    Cancel,
}

/// A protocol-level error that is not tied to a run.
fn protocol_error(message: impl Into<String>) -> Value {
    json!({"type": "error", "content": message.into()})
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Axum handler that upgrades the HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// The run currently streaming on a connection.
struct ActiveRun {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Process a single WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    tracing::info!("WebSocket client connected");

    let (mut sink, mut incoming) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            let text = value.to_string();
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut active: Option<ActiveRun> = None;

    while let Some(Ok(msg)) = incoming.next().await {
        let text = match msg {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            // Ignore binary, ping, pong.
            _ => continue,
        };

        let inbound: Inbound = match serde_json::from_str(text.as_str()) {
            Ok(m) => m,
            Err(e) => {
                let _ = out_tx.send(protocol_error(format!("invalid message: {e}"))).await;
                continue;
            }
        };

        match inbound {
            Inbound::Chat {
                content,
                history,
                config,
            } => {
                if active.as_ref().is_some_and(ActiveRun::is_running) {
                    let _ = out_tx
                        .send(protocol_error("a run is already in progress on this connection"))
                        .await;
                    continue;
                }
                active = Some(start_run(&state, content, history, config, out_tx.clone()));
            }
            Inbound::PermissionResponse {
                request_id,
                approved,
                updated_input,
            } => {
                if !state
                    .engine
                    .respond_permission(&request_id, approved, updated_input)
                {
                    tracing::debug!(request_id = %request_id, "stale permission response over websocket");
                }
            }
            Inbound::Cancel => {
                if let Some(run) = &active {
                    run.cancel.cancel();
                }
            }
        }
    }

    if let Some(run) = active {
        run.cancel.cancel();
    }
    drop(out_tx);
    let _ = writer.await;

    tracing::info!("WebSocket client disconnected");
}

/// Stream one run's events to the connection's writer.
fn start_run(
    state: &AppState,
    content: String,
    history: Vec<Message>,
    overrides: Option<RunOverrides>,
    out: mpsc::Sender<Value>,
) -> ActiveRun {
    let cancel = CancellationToken::new();
    let request = build_request(&state.engine, content, history, overrides);
    let mut events = state.engine.stream(request, cancel.clone());

    let task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let value = match serde_json::to_value(&event) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize stream event");
                    continue;
                }
            };
            if out.send(value).await.is_err() {
                // Writer gone; dropping `events` cancels the run.
                break;
            }
        }
    });

    ActiveRun { cancel, task }
}
