//! Lexical error classifier.
//!
//! [`classify`] turns a raw failure plus an [`ErrorContext`] into a
//! [`ClassifiedError`].  Classification is a fixed-priority rule table; the
//! first rule whose patterns occur in the failure message wins:
//!
//! | Priority | Category | Severity | Recoverable |
//! |----------|----------|----------|-------------|
//! | 1 | [`ErrorCategory::Network`] | Medium | yes |
//! | 2 | [`ErrorCategory::ExternalService`] | Medium | yes |
//! | 3 | [`ErrorCategory::UserInput`] | Low | no |
//! | 4 | [`ErrorCategory::System`] | High | yes |
//! | 5 | [`ErrorCategory::Configuration`] | High | no |
//! | - | [`ErrorCategory::Unknown`] | Medium | no |
//!
//! Failures originating in the tool loop or the LLM client are escalated one
//! severity level.  A failure from the LLM client that is not a network
//! failure is attributed to the external service, whatever else it mentions.
//!
//! Numeric status codes such as `429` only match as a standalone number, not
//! as part of a longer digit run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use aho_corasick::AhoCorasick;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Categories and severities
// ---------------------------------------------------------------------------

/// Failure class used to scope recovery policy and circuit-breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    ExternalService,
    UserInput,
    System,
    Configuration,
    Business,
    Unknown,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Network,
        Self::ExternalService,
        Self::UserInput,
        Self::System,
        Self::Configuration,
        Self::Business,
        Self::Unknown,
    ];

    /// The wire name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::ExternalService => "EXTERNAL_SERVICE",
            Self::UserInput => "USER_INPUT",
            Self::System => "SYSTEM",
            Self::Configuration => "CONFIGURATION",
            Self::Business => "BUSINESS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown error category: {s}"))
    }
}

/// How bad a failure is, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Raise the severity by one level.  `Critical` stays `Critical`.
    pub fn escalated(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery actions
// ---------------------------------------------------------------------------

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Backoff {
    /// Wait the same delay before every retry.
    Fixed,
    /// Multiply the delay by `factor` after each retry, capped at
    /// `max_delay_ms`.
    Exponential { factor: f64, max_delay_ms: u64 },
}

/// An automatic retry policy a caller may choose to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub delay_ms: u64,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay to wait before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => Duration::from_millis(self.delay_ms),
            Backoff::Exponential {
                factor,
                max_delay_ms,
            } => {
                let exp = i32::try_from(retry).unwrap_or(i32::MAX);
                let ms = (self.delay_ms as f64 * factor.powi(exp)).min(max_delay_ms as f64);
                Duration::from_millis(ms as u64)
            }
        }
    }
}

/// A suggested recovery step attached to a [`ClassifiedError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Retry the failed operation automatically.
    Retry(RetryPolicy),
    /// Something a human has to do.
    Manual { code: String, description: String },
}

impl RecoveryAction {
    fn manual(code: &str, description: &str) -> Self {
        Self::Manual {
            code: code.to_owned(),
            description: description.to_owned(),
        }
    }

    /// Whether the action can be executed without human involvement.
    pub fn is_automatic(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Component name of the tool-calling loop.
pub const COMPONENT_TOOL_LOOP: &str = "tool_loop";

/// Component name of the LLM client.
pub const COMPONENT_LLM: &str = "llm";

/// Components whose failures are escalated one severity level.
const ESCALATING_COMPONENTS: &[&str] = &[COMPONENT_TOOL_LOOP, COMPONENT_LLM];

/// Metadata describing where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// The component that observed the failure (e.g. `"llm"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    /// The operation being attempted (e.g. `"chat"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Forces the category instead of matching lexically.  This is the only
    /// way to produce [`ErrorCategory::Business`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,

    /// Free-form diagnostic fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ErrorContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context naming the originating component.
    pub fn component(component: impl Into<String>) -> Self {
        Self {
            component: Some(component.into()),
            ..Self::default()
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn is_component(&self, names: &[&str]) -> bool {
        self.component
            .as_deref()
            .is_some_and(|c| names.iter().any(|n| c.eq_ignore_ascii_case(n)))
    }
}

// ---------------------------------------------------------------------------
// Classified error
// ---------------------------------------------------------------------------

/// The outcome of classifying one raw failure.  Immutable once created.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub recoverable: bool,
    pub suggested_actions: Vec<RecoveryAction>,
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,

    /// The original failure, kept for diagnostics.
    #[serde(skip)]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ClassifiedError {
    /// The first automatic retry policy among the suggested actions.
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.suggested_actions.iter().find_map(|a| match a {
            RecoveryAction::Retry(policy) => Some(policy),
            RecoveryAction::Manual { .. } => None,
        })
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

struct Rule {
    category: ErrorCategory,
    patterns: &'static [&'static str],
}

/// Lexical rules in priority order.  Patterns are matched case-insensitively.
const RULES: &[Rule] = &[
    Rule {
        category: ErrorCategory::Network,
        patterns: &[
            "econnrefused",
            "econnreset",
            "etimedout",
            "enotfound",
            "eai_again",
            "ehostunreach",
            "enetunreach",
            "connection refused",
            "connection reset",
            "connection closed",
            "socket hang up",
            "timed out",
            "timeout",
            "getaddrinfo",
            "dns",
            "network",
        ],
    },
    Rule {
        category: ErrorCategory::ExternalService,
        patterns: &[
            "429",
            "rate limit",
            "rate_limit",
            "ratelimit",
            "too many requests",
            "insufficient_quota",
            "quota exceeded",
            "overloaded",
            "service unavailable",
            "bad gateway",
            "internal server error",
            "upstream",
            "openai",
            "anthropic",
            "deepseek",
        ],
    },
    Rule {
        category: ErrorCategory::UserInput,
        patterns: &[
            "invalid input",
            "invalid argument",
            "invalid parameter",
            "invalid json",
            "validation",
            "malformed",
            "parse error",
            "failed to parse",
            "unexpected token",
            "missing required",
            "expected value",
        ],
    },
    Rule {
        category: ErrorCategory::System,
        patterns: &[
            "out of memory",
            "enomem",
            "heap limit",
            "allocation failed",
            "enospc",
            "no space left",
            "disk full",
            "eacces",
            "eperm",
            "permission denied",
            "access denied",
            "emfile",
            "too many open files",
            "read-only file system",
        ],
    },
    Rule {
        category: ErrorCategory::Configuration,
        patterns: &[
            "api key",
            "api_key",
            "apikey",
            "invalid key",
            "unauthorized",
            "401",
            "authentication",
            "not configured",
            "missing config",
            "configuration",
            "environment variable",
        ],
    },
];

/// A rule compiled into an automaton.  Falls back to substring scanning if
/// the automaton could not be built.
struct CompiledRule {
    category: ErrorCategory,
    patterns: &'static [&'static str],
    automaton: Option<AhoCorasick>,
}

impl CompiledRule {
    fn is_match(&self, lowered: &str) -> bool {
        match &self.automaton {
            Some(ac) => ac
                .find_overlapping_iter(lowered)
                .any(|m| standalone(lowered, m.start(), m.end())),
            None => self.patterns.iter().any(|p| {
                lowered
                    .match_indices(p)
                    .any(|(start, _)| standalone(lowered, start, start + p.len()))
            }),
        }
    }
}

/// A match that begins or ends with a digit must not continue a longer digit
/// run on that side.
fn standalone(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();
    let digit_at = |i: usize| bytes.get(i).is_some_and(u8::is_ascii_digit);
    let open = start == 0 || !digit_at(start) || !digit_at(start - 1);
    let close = end == 0 || !digit_at(end - 1) || !digit_at(end);
    open && close
}

static COMPILED_RULES: LazyLock<Vec<CompiledRule>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|rule| {
            let automaton = AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(rule.patterns)
                .map_err(|e| {
                    tracing::warn!(category = %rule.category, error = %e, "failed to build classifier automaton");
                })
                .ok();
            CompiledRule {
                category: rule.category,
                patterns: rule.patterns,
                automaton,
            }
        })
        .collect()
});

/// Base severity, recoverability, and suggested actions for a category.
fn policy_for(category: ErrorCategory) -> (ErrorSeverity, bool, Vec<RecoveryAction>) {
    match category {
        ErrorCategory::Network => (
            ErrorSeverity::Medium,
            true,
            vec![
                RecoveryAction::Retry(RetryPolicy {
                    max_attempts: 3,
                    delay_ms: 1000,
                    backoff: Backoff::Fixed,
                }),
                RecoveryAction::manual("check_network", "Check the network connection"),
            ],
        ),
        ErrorCategory::ExternalService => (
            ErrorSeverity::Medium,
            true,
            vec![
                RecoveryAction::Retry(RetryPolicy {
                    max_attempts: 5,
                    delay_ms: 1000,
                    backoff: Backoff::Exponential {
                        factor: 2.0,
                        max_delay_ms: 30_000,
                    },
                }),
                RecoveryAction::manual("switch_model", "Switch to another model or provider"),
            ],
        ),
        ErrorCategory::UserInput => (
            ErrorSeverity::Low,
            false,
            vec![RecoveryAction::manual("fix_input", "Correct the input and resubmit")],
        ),
        ErrorCategory::System => (
            ErrorSeverity::High,
            true,
            vec![
                RecoveryAction::Retry(RetryPolicy {
                    max_attempts: 2,
                    delay_ms: 5000,
                    backoff: Backoff::Fixed,
                }),
                RecoveryAction::manual("contact_admin", "Ask an administrator to check system resources"),
            ],
        ),
        ErrorCategory::Configuration => (
            ErrorSeverity::High,
            false,
            vec![RecoveryAction::manual(
                "fix_configuration",
                "Check the configuration and API keys",
            )],
        ),
        ErrorCategory::Business => (
            ErrorSeverity::Low,
            false,
            vec![RecoveryAction::manual("review_request", "Review the request")],
        ),
        ErrorCategory::Unknown => (
            ErrorSeverity::Medium,
            false,
            vec![RecoveryAction::manual("report_issue", "Report the issue with its error id")],
        ),
    }
}

fn match_category(message: &str, context: &ErrorContext) -> ErrorCategory {
    if let Some(category) = context.category {
        return category;
    }

    let lowered = message.to_ascii_lowercase();
    let from_provider = context.is_component(&[COMPONENT_LLM, "provider"]);
    for rule in COMPILED_RULES.iter() {
        if rule.is_match(&lowered) {
            return rule.category;
        }
        if from_provider && rule.category == ErrorCategory::Network {
            return ErrorCategory::ExternalService;
        }
    }

    if from_provider {
        return ErrorCategory::ExternalService;
    }
    ErrorCategory::Unknown
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Classify a raw failure.
///
/// Accepts anything convertible into a boxed error, including plain `&str`
/// and `String` messages.  Every call produces a fresh id and timestamp.
pub fn classify<E>(error: E, context: ErrorContext) -> ClassifiedError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let source: Arc<dyn std::error::Error + Send + Sync> = Arc::from(error.into());
    let message = source.to_string();

    let category = match_category(&message, &context);
    let (mut severity, recoverable, suggested_actions) = policy_for(category);
    if context.is_component(ESCALATING_COMPONENTS) {
        severity = severity.escalated();
    }

    tracing::debug!(
        category = %category,
        severity = ?severity,
        recoverable,
        component = context.component.as_deref().unwrap_or("-"),
        "classified error"
    );

    ClassifiedError {
        id: Uuid::now_v7(),
        category,
        severity,
        message,
        recoverable,
        suggested_actions,
        context,
        timestamp: Utc::now(),
        source: Some(source),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_is_network() {
        let err = classify("connect ECONNREFUSED 127.0.0.1:8080", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::Network);
        assert_eq!(err.severity, ErrorSeverity::Medium);
        assert!(err.recoverable);
        assert!(err.suggested_actions.contains(&RecoveryAction::Retry(RetryPolicy {
            max_attempts: 3,
            delay_ms: 1000,
            backoff: Backoff::Fixed,
        })));
    }

    #[test]
    fn rate_limit_is_external_service_with_backoff() {
        let err = classify("HTTP 429 Too Many Requests", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::ExternalService);
        let policy = err.retry_policy().unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert!(matches!(policy.backoff, Backoff::Exponential { factor, .. } if factor == 2.0));
        assert!(err.suggested_actions.iter().any(
            |a| matches!(a, RecoveryAction::Manual { code, .. } if code == "switch_model")
        ));
    }

    #[test]
    fn validation_is_user_input_manual_only() {
        let err = classify("validation failed: field `path` is required", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::UserInput);
        assert_eq!(err.severity, ErrorSeverity::Low);
        assert!(!err.recoverable);
        assert!(err.suggested_actions.iter().all(|a| !a.is_automatic()));
    }

    #[test]
    fn disk_full_is_system() {
        let err = classify("ENOSPC: no space left on device", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::System);
        assert_eq!(err.severity, ErrorSeverity::High);
        assert!(err.recoverable);
        assert!(err.retry_policy().is_some());
    }

    #[test]
    fn missing_api_key_is_configuration() {
        let err = classify("invalid API key provided", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::Configuration);
        assert!(!err.recoverable);
        assert!(err.retry_policy().is_none());
    }

    #[test]
    fn unmatched_is_unknown() {
        let err = classify("something odd happened", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::Unknown);
        assert_eq!(err.severity, ErrorSeverity::Medium);
        assert!(!err.recoverable);
    }

    #[test]
    fn network_wins_over_later_rules() {
        // Mentions a provider but the connection failure has priority.
        let err = classify("openai: connection reset by peer", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::Network);
    }

    #[test]
    fn loop_and_llm_components_escalate() {
        let err = classify("ECONNRESET", ErrorContext::component(COMPONENT_LLM));
        assert_eq!(err.severity, ErrorSeverity::High);

        let err = classify("disk full", ErrorContext::component(COMPONENT_TOOL_LOOP));
        assert_eq!(err.severity, ErrorSeverity::Critical);

        let err = classify("ECONNRESET", ErrorContext::component("web"));
        assert_eq!(err.severity, ErrorSeverity::Medium);
    }

    #[test]
    fn llm_component_without_lexical_match_is_external() {
        let err = classify("weird provider reply", ErrorContext::component(COMPONENT_LLM));
        assert_eq!(err.category, ErrorCategory::ExternalService);
    }

    #[test]
    fn provider_failures_outrank_input_and_config_rules() {
        let llm = || ErrorContext::component(COMPONENT_LLM);

        let err = classify("failed to parse provider response", llm());
        assert_eq!(err.category, ErrorCategory::ExternalService);
        assert!(err.recoverable);

        let err = classify("401 unauthorized", ErrorContext::component("provider"));
        assert_eq!(err.category, ErrorCategory::ExternalService);

        let err = classify("socket hang up", llm());
        assert_eq!(err.category, ErrorCategory::Network);

        // Outside the model client the lexical rules still apply.
        let err = classify("failed to parse provider response", ErrorContext::component("web"));
        assert_eq!(err.category, ErrorCategory::UserInput);
    }

    #[test]
    fn status_codes_do_not_match_inside_longer_numbers() {
        let err = classify("expected value at line 1 column 429", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::UserInput);

        let err = classify("order 14015 rejected", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::Unknown);

        let err = classify("request 4290 queued", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::Unknown);

        for message in ["HTTP 429 Too Many Requests", "status=429", "(429)", "429"] {
            assert_eq!(
                classify(message, ErrorContext::new()).category,
                ErrorCategory::ExternalService,
                "{message}"
            );
        }
        let err = classify("got 401 from gateway", ErrorContext::new());
        assert_eq!(err.category, ErrorCategory::Configuration);
    }

    #[test]
    fn explicit_category_overrides_patterns() {
        let err = classify(
            "order limit reached",
            ErrorContext::new().with_category(ErrorCategory::Business),
        );
        assert_eq!(err.category, ErrorCategory::Business);
        assert!(!err.recoverable);
    }

    #[test]
    fn each_classification_is_unique_and_keeps_source() {
        let a = classify("timeout", ErrorContext::new());
        let b = classify("timeout", ErrorContext::new());
        assert_ne!(a.id, b.id);
        assert_eq!(a.source.as_ref().unwrap().to_string(), "timeout");
    }

    #[test]
    fn context_is_retained() {
        let ctx = ErrorContext::component("tool_loop")
            .with_operation("chat")
            .with_metadata("iteration", 3);
        let err = classify("boom", ctx.clone());
        assert_eq!(err.context, ctx);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay_ms: 1000,
            backoff: Backoff::Exponential {
                factor: 2.0,
                max_delay_ms: 5000,
            },
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(5000));
    }

    #[test]
    fn category_round_trips_through_str() {
        for c in ErrorCategory::ALL {
            assert_eq!(c.as_str().parse::<ErrorCategory>().unwrap(), c);
        }
        assert!("bogus".parse::<ErrorCategory>().is_err());
    }

    #[test]
    fn serializes_with_wire_names() {
        let err = classify("ECONNREFUSED", ErrorContext::new());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["category"], "NETWORK");
        assert_eq!(json["severity"], "MEDIUM");
        assert_eq!(json["suggestedActions"][0]["type"], "retry");
        assert_eq!(json["suggestedActions"][0]["maxAttempts"], 3);
    }
}
