use std::future::Future;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use crate::runtime::error::BrokerError;

pub mod deregistration;
pub mod provisioning;
pub mod shadow_update;

pub const RETRY_BACKOFF_BASE_MS: u64 = 100;
const RETRY_BACKOFF_MAX_MS: u64 = 2_000;

/// Runs one external call under the per-call timeout, shortened to whatever
/// remains of the caller's deadline.
pub(crate) async fn bounded<T>(
    operation: &str,
    call_timeout: Duration,
    deadline: Option<Instant>,
    call: impl Future<Output = Result<T, BrokerError>>,
) -> Result<T, BrokerError> {
    let budget = match deadline {
        Some(deadline) => call_timeout.min(deadline.saturating_duration_since(Instant::now())),
        None => call_timeout,
    };
    if budget.is_zero() {
        return Err(BrokerError::timeout(operation, budget));
    }
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::timeout(operation, budget)),
    }
}

/// Sleeps before retry `attempt + 1`. Returns `false` without sleeping when the
/// backoff would run past the deadline.
pub(crate) async fn backoff_before_retry(attempt: u32, deadline: Option<Instant>) -> bool {
    let delay_ms = RETRY_BACKOFF_BASE_MS
        .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
        .min(RETRY_BACKOFF_MAX_MS);
    let wake_at = Instant::now() + Duration::from_millis(delay_ms);
    if deadline.is_some_and(|deadline| wake_at >= deadline) {
        return false;
    }
    tokio::time::sleep_until(wake_at).await;
    true
}

pub(crate) fn log_info(component: &str, event: &str, details: Value) {
    eprintln!(
        "{}",
        json!({
            "component": component,
            "event": event,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "details": details,
        })
    );
}

pub(crate) fn log_error(component: &str, event: &str, details: Value) {
    eprintln!(
        "{}",
        json!({
            "component": component,
            "level": "error",
            "event": event,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "details": details,
        })
    );
}
