//! Bounded retry with exponential backoff, at the caller's discretion.
//!
//! The core never retries streams or optimistic writes on its own (a write
//! that failed on the wire may still have taken effect server-side), so this
//! helper is opt-in: wrap a plain read in `with_backoff` when a transient
//! network failure is worth absorbing.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget runs out. Only [`ApiError::is_retryable`] failures are
/// retried; auth and rate-limit errors pass straight through.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut delay = policy.base_delay;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    "Attempt {}/{} failed ({}); retrying in {:?}",
                    attempt,
                    attempts,
                    error,
                    delay
                );
                sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(error) => return Err(error),
        }
    }

    unreachable!("retry loop always returns from its final attempt")
}
