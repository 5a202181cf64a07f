//! Outstanding approval requests and their resolution.
//!
//! [`PermissionBroker::request`] registers a request and hands back a
//! [`PermissionTicket`]; whoever talks to the user later calls
//! [`PermissionBroker::respond`] with the request id.  Every request resolves
//! exactly once: by a response, by its timeout (deny), or by disposal (deny).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::policy::Gate;
use crate::error::{AgentError, Result};

/// How long a request waits for a decision before it is denied.
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A tool call waiting for approval, as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub is_dangerous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Denied,
    TimedOut,
    /// The broker shut down before anyone answered.
    Disposed,
}

/// The resolution delivered to the waiting tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionDecision {
    pub request_id: String,
    pub outcome: DecisionOutcome,
    /// Arguments the tool should run with.  Only meaningful when approved.
    pub input: Value,
}

impl PermissionDecision {
    pub fn is_approved(&self) -> bool {
        self.outcome == DecisionOutcome::Approved
    }
}

/// Handle on one outstanding request.
///
/// Dropping the ticket before a decision arrives withdraws the request.
#[derive(Debug)]
pub struct PermissionTicket {
    request_id: String,
    rx: Option<oneshot::Receiver<PermissionDecision>>,
    broker: Weak<BrokerInner>,
}

impl PermissionTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the decision.  A broker dropped mid-wait counts as disposal.
    pub async fn decision(mut self) -> PermissionDecision {
        let received = match self.rx.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        };
        received.unwrap_or_else(|| PermissionDecision {
            request_id: self.request_id.clone(),
            outcome: DecisionOutcome::Disposed,
            input: Value::Null,
        })
    }
}

impl Drop for PermissionTicket {
    fn drop(&mut self) {
        let Some(inner) = self.broker.upgrade() else {
            return;
        };
        if let Some((_, pending)) = inner.pending.remove(&self.request_id) {
            if let Some(timer) = &pending.timer {
                timer.abort();
            }
            tracing::debug!(
                request_id = %self.request_id,
                tool = %pending.request.tool_name,
                "permission request withdrawn"
            );
        }
    }
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    request: PermissionRequest,
    reply: oneshot::Sender<PermissionDecision>,
    timer: Option<AbortHandle>,
}

#[derive(Debug)]
struct BrokerInner {
    pending: DashMap<String, Pending>,
    timeout: Duration,
    closed: AtomicBool,
    next_seq: AtomicU64,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Keyed store of outstanding approval requests.  Cheap to clone.
#[derive(Clone)]
pub struct PermissionBroker {
    inner: Arc<BrokerInner>,
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PERMISSION_TIMEOUT)
    }
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker")
            .field("pending", &self.inner.pending.len())
            .field("timeout", &self.inner.timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PermissionBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                pending: DashMap::new(),
                timeout,
                closed: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register a request for `tool_name` and start its timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(
        &self,
        tool_name: &str,
        tool_input: Value,
        gate: Gate,
    ) -> Result<(PermissionRequest, PermissionTicket)> {
        if self.is_closed() {
            return Err(AgentError::PermissionBrokerClosed);
        }

        let request_id = Uuid::now_v7().to_string();
        let request = PermissionRequest {
            request_id: request_id.clone(),
            tool_name: tool_name.to_owned(),
            tool_input,
            is_dangerous: gate.is_dangerous,
            reason: gate.reason,
        };
        let (reply, rx) = oneshot::channel();

        // The shard stays locked until the entry holds its timer, so neither a
        // response nor the timer itself can observe a half-registered request.
        match self.inner.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(AgentError::Internal(format!(
                    "duplicate permission request id {request_id}"
                )));
            }
            Entry::Vacant(slot) => {
                let timer = self.spawn_timer(request_id.clone());
                slot.insert(Pending {
                    seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
                    request: request.clone(),
                    reply,
                    timer: Some(timer),
                });
            }
        }

        tracing::info!(
            request_id = %request_id,
            tool = %request.tool_name,
            dangerous = request.is_dangerous,
            "permission requested"
        );

        let ticket = PermissionTicket {
            request_id,
            rx: Some(rx),
            broker: Arc::downgrade(&self.inner),
        };
        Ok((request, ticket))
    }

    fn spawn_timer(&self, request_id: String) -> AbortHandle {
        let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                if resolve(&inner, &request_id, DecisionOutcome::TimedOut, None) {
                    tracing::warn!(request_id = %request_id, timeout_secs = timeout.as_secs(), "permission request timed out, denying");
                }
            }
        })
        .abort_handle()
    }

    /// Deliver a decision.  Returns `false` for unknown or already-resolved
    /// ids, which are otherwise ignored.
    pub fn respond(&self, request_id: &str, approved: bool, updated_input: Option<Value>) -> bool {
        let outcome = if approved {
            DecisionOutcome::Approved
        } else {
            DecisionOutcome::Denied
        };
        let resolved = resolve(&self.inner, request_id, outcome, updated_input);
        if !resolved {
            tracing::debug!(request_id, approved, "response for unknown or resolved permission request ignored");
        }
        resolved
    }

    /// Outstanding requests, oldest first.
    pub fn pending(&self) -> Vec<PermissionRequest> {
        let mut requests: Vec<_> = self
            .inner
            .pending
            .iter()
            .map(|entry| (entry.seq, entry.request.clone()))
            .collect();
        requests.sort_by_key(|(seq, _)| *seq);
        requests.into_iter().map(|(_, request)| request).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Deny every outstanding request, cancel their timers and refuse new
    /// ones.
    pub fn dispose(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let ids: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let count = ids
            .iter()
            .filter(|id| resolve(&self.inner, id, DecisionOutcome::Disposed, None))
            .count();
        tracing::info!(denied = count, "permission broker disposed");
    }
}

/// Remove `request_id` from the pending set and deliver its decision.
fn resolve(
    inner: &BrokerInner,
    request_id: &str,
    outcome: DecisionOutcome,
    updated_input: Option<Value>,
) -> bool {
    let Some((_, pending)) = inner.pending.remove(request_id) else {
        return false;
    };

    if outcome != DecisionOutcome::TimedOut {
        if let Some(timer) = &pending.timer {
            timer.abort();
        }
    }

    let input = match outcome {
        DecisionOutcome::Approved => updated_input
            .filter(has_content)
            .unwrap_or(pending.request.tool_input),
        _ => pending.request.tool_input,
    };

    tracing::debug!(request_id, ?outcome, tool = %pending.request.tool_name, "permission resolved");

    // The waiting run may already be gone; nothing to deliver then.
    let _ = pending.reply.send(PermissionDecision {
        request_id: request_id.to_owned(),
        outcome,
        input,
    });
    true
}

/// Whether an approval's replacement input actually carries arguments.
fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn gate() -> Gate {
        Gate {
            is_dangerous: true,
            reason: Some("destructive command: rm -rf /tmp/x".into()),
        }
    }

    #[tokio::test]
    async fn approve_with_original_input() {
        let broker = PermissionBroker::default();
        let input = json!({"command": "rm -rf /tmp/x"});
        let (request, ticket) = broker.request("bash", input.clone(), gate()).unwrap();
        assert_eq!(broker.pending_count(), 1);

        assert!(broker.respond(&request.request_id, true, None));
        let decision = ticket.decision().await;
        assert!(decision.is_approved());
        assert_eq!(decision.input, input);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn empty_updated_input_falls_back_to_original() {
        let broker = PermissionBroker::default();
        let input = json!({"path": "/tmp/a"});
        let (request, ticket) = broker.request("delete_file", input.clone(), gate()).unwrap();
        broker.respond(&request.request_id, true, Some(json!({})));
        assert_eq!(ticket.decision().await.input, input);

        let (request, ticket) = broker.request("delete_file", input.clone(), gate()).unwrap();
        broker.respond(&request.request_id, true, Some(Value::Null));
        assert_eq!(ticket.decision().await.input, input);
    }

    #[tokio::test]
    async fn updated_input_replaces_original() {
        let broker = PermissionBroker::default();
        let (request, ticket) = broker
            .request("delete_file", json!({"path": "/tmp/a"}), gate())
            .unwrap();
        broker.respond(&request.request_id, true, Some(json!({"path": "/tmp/b"})));
        assert_eq!(ticket.decision().await.input, json!({"path": "/tmp/b"}));
    }

    #[tokio::test]
    async fn deny_and_duplicate_response() {
        let broker = PermissionBroker::default();
        let (request, ticket) = broker.request("bash", json!({}), gate()).unwrap();
        assert!(broker.respond(&request.request_id, false, None));
        assert!(!broker.respond(&request.request_id, true, None));
        assert_eq!(ticket.decision().await.outcome, DecisionOutcome::Denied);
    }

    #[tokio::test]
    async fn unknown_id_is_a_noop() {
        let broker = PermissionBroker::default();
        assert!(!broker.respond("missing", true, None));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_denies_once() {
        let broker = PermissionBroker::new(Duration::from_secs(60));
        let (request, ticket) = broker.request("bash", json!({}), gate()).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let decision = ticket.decision().await;
        assert_eq!(decision.outcome, DecisionOutcome::TimedOut);
        assert!(!decision.is_approved());
        assert_eq!(broker.pending_count(), 0);
        assert!(!broker.respond(&request.request_id, true, None));
    }

    #[tokio::test(start_paused = true)]
    async fn response_before_timeout_wins() {
        let broker = PermissionBroker::new(Duration::from_secs(60));
        let (request, ticket) = broker.request("bash", json!({}), gate()).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        broker.respond(&request.request_id, true, None);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(ticket.decision().await.outcome, DecisionOutcome::Approved);
    }

    #[tokio::test(start_paused = true)]
    async fn response_cancels_the_timer() {
        let broker = PermissionBroker::new(Duration::from_secs(60));
        let (request, ticket) = broker.request("bash", json!({}), gate()).unwrap();
        let timer = broker
            .inner
            .pending
            .get(&request.request_id)
            .and_then(|p| p.timer.clone())
            .unwrap();

        broker.respond(&request.request_id, false, None);
        settle().await;
        assert!(timer.is_finished());
        assert_eq!(ticket.decision().await.outcome, DecisionOutcome::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_ticket_withdraws_the_request() {
        let broker = PermissionBroker::new(Duration::from_secs(60));
        let (request, ticket) = broker.request("bash", json!({}), gate()).unwrap();
        let timer = broker
            .inner
            .pending
            .get(&request.request_id)
            .and_then(|p| p.timer.clone())
            .unwrap();
        assert_eq!(broker.pending_count(), 1);

        drop(ticket);
        assert_eq!(broker.pending_count(), 0);
        assert!(broker.pending().is_empty());
        assert!(!broker.respond(&request.request_id, true, None));

        settle().await;
        assert!(timer.is_finished());
    }

    #[tokio::test]
    async fn dropping_a_resolved_ticket_is_harmless() {
        let broker = PermissionBroker::default();
        let (first, first_ticket) = broker.request("bash", json!({}), gate()).unwrap();
        let (_, _second_ticket) = broker.request("bash", json!({}), gate()).unwrap();

        broker.respond(&first.request_id, true, None);
        drop(first_ticket);
        assert_eq!(broker.pending_count(), 1);
    }

    #[tokio::test]
    async fn dispose_denies_everything() {
        let broker = PermissionBroker::default();
        let (_, first) = broker.request("bash", json!({}), gate()).unwrap();
        let (_, second) = broker.request("send_email", json!({}), gate()).unwrap();

        broker.dispose();
        assert_eq!(first.decision().await.outcome, DecisionOutcome::Disposed);
        assert_eq!(second.decision().await.outcome, DecisionOutcome::Disposed);
        assert_eq!(broker.pending_count(), 0);
        assert!(matches!(
            broker.request("bash", json!({}), gate()),
            Err(AgentError::PermissionBrokerClosed)
        ));
    }

    #[tokio::test]
    async fn pending_lists_oldest_first() {
        let broker = PermissionBroker::default();
        let (a, _ta) = broker.request("first", json!({}), gate()).unwrap();
        let (b, _tb) = broker.request("second", json!({}), gate()).unwrap();
        let pending = broker.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].request_id, a.request_id);
        assert_eq!(pending[1].request_id, b.request_id);
    }

    #[test]
    fn request_serializes_camel_case() {
        let request = PermissionRequest {
            request_id: "r1".into(),
            tool_name: "bash".into(),
            tool_input: json!({"command": "ls"}),
            is_dangerous: false,
            reason: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"requestId": "r1", "toolName": "bash", "toolInput": {"command": "ls"}, "isDangerous": false})
        );
    }
}
