//! Bounded exponential backoff around provider calls.
//!
//! One combinator wraps every provider call; there are no per-call-site retry
//! loops. Exhausting attempts is a normal outcome — the resolver treats it as
//! "this provider yielded nothing" and moves on.

use std::future::Future;
use std::time::Duration;

use crate::providers::ProviderError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default 3).
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following 0-based `attempt`:
    /// `base_delay * 2^attempt`, raised to the provider's Retry-After hint
    /// when one was given, plus up to 10% jitter to avoid thundering in
    /// lockstep with sibling workers.
    fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let floor = hint.map_or(exp, |h| exp.max(h));
        let jitter_ms = (floor.as_millis() as u64 / 10).max(1);
        floor + Duration::from_millis(fastrand::u64(0..jitter_ms))
    }
}

/// Run `call`, retrying on `RateLimited` and `Transient` errors with
/// exponential backoff. `NotFound` and `Malformed` are not transient and are
/// returned immediately; so is the last error once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut call: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts.max(1) => {
                let hint = match &err {
                    ProviderError::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                let delay = policy.backoff(attempt, hint);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying provider call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
