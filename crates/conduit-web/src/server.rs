//! Main web server setup and startup.
//!
//! [`WebServer`] composes the Axum router, registers all routes, and starts
//! the HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::Method;
use axum::routing::{get, post};
use conduit_agent::Engine;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::WebConfig;
use crate::api;
use crate::state::AppState;
use crate::ws;

/// Boxed error returned by server startup.
pub type ServeError = Box<dyn std::error::Error + Send + Sync>;

/// The conduit web server.
pub struct WebServer {
    config: WebConfig,
    state: Arc<AppState>,
}

impl WebServer {
    /// Create a new web server around an engine.
    ///
    /// # Arguments
    ///
    /// * `config` - Bind address and port configuration.
    /// * `engine` - The engine shared by every connection.
    pub fn new(config: WebConfig, engine: Engine) -> Self {
        let state = Arc::new(AppState::new(engine, config.clone()));
        Self { config, state }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Build the Axum router with all routes registered.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any);

        Router::new()
            // REST API.
            .route("/api/status", get(api::status))
            .route("/api/chat", post(api::chat))
            .route("/api/permissions", get(api::list_permissions))
            .route("/api/permissions/{id}", post(api::respond_permission))
            .route("/api/circuits/reset", post(api::reset_circuits))
            // WebSocket.
            .route("/ws", get(ws::ws_handler))
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Start the server and block until it is shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound.
    pub async fn start(self) -> Result<(), ServeError> {
        let addr = self.addr();
        tracing::info!(addr = %addr, "starting web server");

        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServeError> {
        let router = self.router();
        axum::serve(listener, router).await?;
        self.state.engine.shutdown();
        Ok(())
    }

    /// Bind and serve in a background task, returning the bound address.
    ///
    /// With `port = 0` the operating system picks a free port.
    pub async fn spawn(self) -> Result<(SocketAddr, JoinHandle<()>), ServeError> {
        let listener = TcpListener::bind(self.addr()).await?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "web server listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = self.serve(listener).await {
                tracing::error!(error = %e, "web server stopped");
            }
        });
        Ok((local, handle))
    }
}
