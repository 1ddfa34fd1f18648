//! Fetch retry logic
//!
//! Exponential backoff with jitter for transient provider failures, bounded by
//! the attempt count of the configured [`RetryPolicy`].

use paddock_common::config::RetryPolicy;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::FetchError;

/// Retry a fetch while it fails transiently
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. If successful, return result
/// 3. If the error is permanent, return it immediately (no retry)
/// 4. If transient and attempts remain: log WARN, sleep backoff, retry
/// 5. If transient and attempts are exhausted: return a transient error
///    carrying the total attempt count
///
/// **Backoff Strategy:**
/// - Delay before retry `n` is `base * 2^(n-1)`, capped at `max_delay`
/// - Equal jitter: half of the delay is fixed, the other half random
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = operation_name,
                        attempt,
                        "Fetch succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_transient() => {
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    "Permanent fetch failure, not retrying"
                );
                return Err(err);
            }
            Err(err) => {
                let message = match &err {
                    FetchError::Transient { message, .. } => message.clone(),
                    other => other.to_string(),
                };

                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        error = %message,
                        "Fetch failed: retry attempts exhausted"
                    );
                    return Err(FetchError::Transient {
                        attempts: attempt,
                        message,
                    });
                }

                let delay = jittered(policy.backoff(attempt));
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transient fetch failure, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let half_ms = (delay.as_millis() / 2) as u64;
    let extra = if half_ms > 0 {
        rand::thread_rng().gen_range(0..=half_ms)
    } else {
        0
    };
    Duration::from_millis(half_ms + extra)
}
