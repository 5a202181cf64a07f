//! Approval policy: which tool calls need a human decision.
//!
//! # Evaluation
//!
//! 1. Interactive tools (those that talk to the user directly) are gated in
//!    every mode.
//! 2. [`ApprovalMode::Ask`] gates everything else.
//! 3. [`ApprovalMode::Dangerous`] gates tools in [`DANGEROUS_TOOLS`] and
//!    shell tools whose command matches a destructive pattern.
//! 4. [`ApprovalMode::Auto`] gates nothing else.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

// ---------------------------------------------------------------------------
// Approval mode
// ---------------------------------------------------------------------------

/// How aggressively tool calls are gated behind approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Run everything except interactive tools without asking.
    Auto,
    /// Ask before every tool call.
    Ask,
    /// Ask only for dangerous tools and destructive shell commands.
    #[default]
    Dangerous,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Ask => "ask",
            Self::Dangerous => "dangerous",
        }
    }
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "ask" => Ok(Self::Ask),
            "dangerous" => Ok(Self::Dangerous),
            other => Err(AgentError::ConfigError {
                reason: format!("unknown approval mode `{other}` (expected auto, ask or dangerous)"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Static tables
// ---------------------------------------------------------------------------

/// Tools that interact with the user and always wait for their answer.
pub const INTERACTIVE_TOOLS: &[&str] = &["ask_user"];

/// Tools gated in [`ApprovalMode::Dangerous`] regardless of arguments.
pub const DANGEROUS_TOOLS: &[(&str, &str)] = &[
    ("delete_file", "deletes a file"),
    ("remove_directory", "removes a directory"),
    ("move_file", "moves or renames a file"),
    ("send_email", "sends an email on your behalf"),
    ("delete_email", "deletes an email"),
    ("cron_remove", "removes a scheduled job"),
    ("execute_script", "executes an arbitrary script"),
    ("install_plugin", "installs third-party code"),
];

/// Tools whose `command` argument is run by a shell.
pub const SHELL_TOOLS: &[&str] = &["bash", "shell", "execute_command", "run_command", "terminal"];

/// Destructive shell command patterns with a human-readable label.
const DESTRUCTIVE_PATTERNS: &[(&str, &str)] = &[
    (r"\brm\s+(-[a-z]*[rf][a-z]*\s+)+", "recursive or forced delete"),
    (r"\bsudo\b", "privilege escalation"),
    (r"\bmkfs(\.\w+)?\b", "filesystem format"),
    (r"\bdd\s+if=", "raw disk write"),
    (r">\s*/dev/(sd|nvme|hd)", "write to block device"),
    (r"\b(shutdown|reboot|halt|poweroff)\b", "system power control"),
    (r":\(\)\s*\{\s*:\|:&\s*\};:", "fork bomb"),
    (r"\bchmod\s+(-R\s+)?0?777\b", "world-writable permissions"),
    (r"\bchown\s+-R\b", "recursive ownership change"),
    (r"\bgit\s+push\s+.*(--force|-f)\b", "force push"),
    (r"\bgit\s+reset\s+--hard\b", "hard reset"),
    (r"\bkill\s+-9\b", "forced process kill"),
    (r"\b(curl|wget)\b[^|]*\|\s*(ba|z)?sh\b", "piping a download into a shell"),
    (r"\bdrop\s+(table|database)\b", "dropping database objects"),
];

static DESTRUCTIVE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    DESTRUCTIVE_PATTERNS
        .iter()
        .filter_map(|(pattern, label)| match Regex::new(&format!("(?i){pattern}")) {
            Ok(re) => Some((re, *label)),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "skipping invalid destructive pattern");
                None
            }
        })
        .collect()
});

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Why a tool call must wait for approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gate {
    pub is_dangerous: bool,
    pub reason: Option<String>,
}

/// The shell command a tool call would run, if any.
pub fn shell_command(tool_name: &str, input: &Value) -> Option<String> {
    if !SHELL_TOOLS.contains(&tool_name) {
        return None;
    }
    input
        .get("command")
        .or_else(|| input.get("cmd"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// The label of the first destructive pattern matching `command`.
pub fn destructive_match(command: &str) -> Option<&'static str> {
    DESTRUCTIVE
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map(|(_, label)| *label)
}

/// Whether a call is dangerous independent of the approval mode.
fn danger_reason(tool_name: &str, input: &Value) -> Option<String> {
    if let Some((_, what)) = DANGEROUS_TOOLS.iter().find(|(name, _)| *name == tool_name) {
        return Some(format!("`{tool_name}` {what}"));
    }
    let command = shell_command(tool_name, input)?;
    let label = destructive_match(&command)?;
    Some(format!("destructive command ({label}): {command}"))
}

/// Decide whether a tool call must be approved before it runs.
pub fn evaluate(mode: ApprovalMode, tool_name: &str, input: &Value) -> Option<Gate> {
    let danger = danger_reason(tool_name, input);

    if INTERACTIVE_TOOLS.contains(&tool_name) {
        return Some(Gate {
            is_dangerous: danger.is_some(),
            reason: danger.or_else(|| Some(format!("`{tool_name}` waits for your input"))),
        });
    }

    match mode {
        ApprovalMode::Auto => None,
        ApprovalMode::Ask => Some(Gate {
            is_dangerous: danger.is_some(),
            reason: danger,
        }),
        ApprovalMode::Dangerous => danger.map(|reason| Gate {
            is_dangerous: true,
            reason: Some(reason),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
