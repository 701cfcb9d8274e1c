//! Bounded exponential backoff

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy: `max_attempts` tries in total, sleeping
/// `base_delay * 2^(attempt - 1)` (capped at `max_delay`) between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay slept after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. The last error is returned as-is.
    pub async fn run<T, E, F, Fut, R>(&self, what: &str, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if retryable(&e) && attempt < self.max_attempts => {
                    let backoff = self.delay_for(attempt);
                    warn!(what, attempt, error = %e, ?backoff, "Transient failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if attempt > 1 {
                        warn!(what, attempt, error = %e, "Giving up after retries");
                    }
                    return Err(e);
                }
            }
        }
    }
}
