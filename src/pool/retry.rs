//! Retry with jittered delay
//!
//! Delivery work is retried a fixed number of times with a small random
//! pause between attempts. Only transient errors (store, broker, I/O) are
//! retried. After the last failure the error is returned and the caller
//! drops the work.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;

/// Default number of attempts
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default upper bound of the random delay between attempts
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(10);

/// Retry policy for delivery tasks
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay between attempts is drawn from `[0, max_jitter)`
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Set the number of attempts (at least one)
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the jitter upper bound
    pub fn max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_micros() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..max))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts are
    /// exhausted
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(attempt = attempt, error = %e, "Attempt failed, retrying");
                    tokio::time::sleep(self.jitter()).await;
                    attempt += 1;
                }
            }
        }
    }
}
