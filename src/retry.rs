use log::warn;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff for outbound HTTP calls.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects, or
/// the policy's attempt budget is spent. The last error is returned as-is.
pub async fn run_with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut op: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < max_attempts && is_retryable(&error) => {
                let delay = backoff_delay(policy, attempt);
                warn!(
                    "attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, max_attempts, error, delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let exponential_ms = policy
        .initial_backoff
        .as_millis()
        .saturating_mul(1u128 << shift);
    let capped_ms = exponential_ms.min(policy.max_backoff.as_millis());

    Duration::from_millis(capped_ms.min(u64::MAX as u128) as u64)
}
