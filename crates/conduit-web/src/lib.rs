//! Web interface for the conduit agent engine.
//!
//! This crate exposes an [`Engine`](conduit_agent::Engine) over HTTP and
//! WebSocket:
//!
//! - `/ws` streams run events and accepts permission responses.
//! - A REST API for one-shot chat, pending approvals, and circuit status.

pub mod api;
pub mod error;
pub mod server;
pub mod state;
pub mod ws;

use tracing_subscriber::EnvFilter;

pub use error::ApiError;
pub use server::WebServer;
pub use state::AppState;

/// Web server configuration.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.  `0` picks an ephemeral port.
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

/// Install a compact `tracing` subscriber filtered by `RUST_LOG`, falling
/// back to `default_level`.  Safe to call more than once.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_localhost() {
        let config = WebConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing("debug");
        init_tracing("info");
        tracing::info!("subscriber installed");
    }
}
