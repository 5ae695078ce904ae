use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Errors that can tell the retry loop whether another attempt is worthwhile.
pub trait RetryableError: std::fmt::Display {
    fn is_retryable(&self) -> bool;

    /// Error to report when a single attempt exceeds its deadline.
    fn timed_out(timeout: Duration) -> Self;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given attempt (1-based), with up to 50% jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        let jitter_ms = if delay_ms > 1 {
            rand::thread_rng().gen_range(0..=delay_ms / 2)
        } else {
            0
        };
        Duration::from_millis(delay_ms + jitter_ms)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent. Every attempt is bounded by the policy timeout.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: RetryableError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(policy.attempt_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.attempt_timeout)),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}/{}", operation_name, attempt, max_attempts);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {}ms",
                    operation_name,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("{} gave up after {} attempt(s): {}", operation_name, attempt, e);
                return Err(e);
            }
        }
    }
}
