//! Retry logic.
//!
//! # Responsibilities
//! - Re-run an operation while it fails with a retryable error
//! - Sleep with exponential backoff + jitter between attempts
//!
//! # Design Decisions
//! - Breaker and quota rejections are never retried; they already say "not now"
//! - Pool exhaustion, timeouts, transport errors and 429/5xx are retried
//! - `max_attempts` counts the first try

use std::future::Future;

use crate::config::RetryConfig;
use crate::error::GatewayResult;
use crate::resilience::backoff::calculate_backoff;

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryConfig, label: &str, mut op: F) -> GatewayResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let max_attempts = if policy.enabled {
        policy.max_attempts.max(1)
    } else {
        1
    };

    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = calculate_backoff(attempt, policy.base_delay_ms, policy.max_delay_ms);
                tracing::debug!(
                    target_name = %label,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    tracing::warn!(target_name = %label, attempts = attempt, error = %e, "Giving up");
                }
                return Err(e);
            }
        }
    }
}
