//! Shared application state for the web server.

use std::time::Instant;

use conduit_agent::Engine;

use crate::WebConfig;

/// Shared state accessible from every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// The engine every run goes through.  Its broker and breaker are shared
    /// by all connections.
    pub engine: Engine,

    /// Web server configuration.
    pub config: WebConfig,

    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Engine, config: WebConfig) -> Self {
        Self {
            engine,
            config,
            started_at: Instant::now(),
        }
    }
}
