//! Execution of suggested recovery actions.
//!
//! A [`ClassifiedError`](crate::ClassifiedError) only *suggests* a retry
//! policy.  Callers that want to act on it hand the suggestion list and the
//! operation to [`run_with_recovery`].  Manual actions are never executed.

use std::fmt::Display;
use std::future::Future;

use crate::classifier::RecoveryAction;
use crate::error::ReliabilityError;

/// Run `operation`, retrying it according to the first automatic action in
/// `actions`.
///
/// `operation` receives the 1-based attempt number.  Without an automatic
/// action the operation runs exactly once.  When every attempt fails the last
/// error is reported as [`ReliabilityError::RetriesExhausted`].
pub async fn run_with_recovery<T, E, F, Fut>(
    actions: &[RecoveryAction],
    mut operation: F,
) -> Result<T, ReliabilityError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let policy = actions.iter().find_map(|a| match a {
        RecoveryAction::Retry(policy) => Some(policy),
        RecoveryAction::Manual { .. } => None,
    });
    let max_attempts = policy.map_or(1, |p| p.max_attempts.max(1));

    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "operation recovered after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!(attempt, max_attempts, error = %e, "recoverable operation failed");
                let Some(policy) = policy.filter(|_| attempt < max_attempts) else {
                    return Err(ReliabilityError::RetriesExhausted {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                };
                let delay = policy.delay_for(attempt - 1);
                tracing::debug!(delay = ?delay, "retrying after delay");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
