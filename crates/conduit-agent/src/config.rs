//! Engine configuration.
//!
//! Loaded from TOML, then selectively overridden from `CONDUIT_*` environment
//! variables.  Every section and field has a default, so an empty file is a
//! valid configuration.
//!
//! ```toml
//! [agent]
//! model = "claude-sonnet"
//! max_iterations = 20
//! approval_mode = "dangerous"
//!
//! [permissions]
//! timeout_secs = 60
//!
//! [breaker]
//! failure_threshold = 5
//! success_threshold = 2
//! reset_timeout_ms = 60000
//!
//! [stream]
//! channel_capacity = 64
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use conduit_reliability::BreakerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::permission::{ApprovalMode, DEFAULT_PERMISSION_TIMEOUT};

pub const ENV_MODEL: &str = "CONDUIT_MODEL";
pub const ENV_MAX_ITERATIONS: &str = "CONDUIT_MAX_ITERATIONS";
pub const ENV_APPROVAL_MODE: &str = "CONDUIT_APPROVAL_MODE";
pub const ENV_PERMISSION_TIMEOUT_SECS: &str = "CONDUIT_PERMISSION_TIMEOUT_SECS";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Settings for a single run of the tool-calling loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Provider model id.  `None` lets the client pick its default.
    pub model: Option<String>,

    /// Prepended as a system message unless empty.
    pub system_prompt: Option<String>,

    /// Model calls allowed per run; `0` means unlimited.
    pub max_iterations: u32,

    pub approval_mode: ApprovalMode,

    /// Working directory handed to tools.
    pub cwd: Option<PathBuf>,
}

impl RunConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// The system prompt, if it carries any text.
    pub fn effective_system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub timeout_secs: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_PERMISSION_TIMEOUT.as_secs(),
        }
    }
}

impl PermissionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Events buffered between a streaming run and its consumer.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defaults for every run; requests may override them.
    pub agent: RunConfig,
    pub permissions: PermissionConfig,
    pub breaker: BreakerConfig,
    pub stream: StreamConfig,
}

impl EngineConfig {
    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| AgentError::ConfigError {
            reason: format!("invalid config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CONDUIT_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup(ENV_MODEL).filter(|m| !m.trim().is_empty()) {
            tracing::debug!(model = %model, "model overridden from environment");
            self.agent.model = Some(model);
        }
        if let Some(raw) = lookup(ENV_MAX_ITERATIONS) {
            self.agent.max_iterations = parse_number(ENV_MAX_ITERATIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_APPROVAL_MODE) {
            self.agent.approval_mode = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_PERMISSION_TIMEOUT_SECS) {
            self.permissions.timeout_secs = parse_number(ENV_PERMISSION_TIMEOUT_SECS, &raw)?;
        }
        self.validate()
    }

    /// Reject values that would make the engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(AgentError::ConfigError {
                reason: "breaker.failure_threshold must be at least 1".into(),
            });
        }
        if self.breaker.success_threshold == 0 {
            return Err(AgentError::ConfigError {
                reason: "breaker.success_threshold must be at least 1".into(),
            });
        }
        if self.stream.channel_capacity == 0 {
            return Err(AgentError::ConfigError {
                reason: "stream.channel_capacity must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| AgentError::ConfigError {
        reason: format!("{key}={raw:?} is not a valid number: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
