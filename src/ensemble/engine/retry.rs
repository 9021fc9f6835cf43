// SPDX-License-Identifier: MIT

//! Exponential backoff for operations that may fail transiently

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How many times an operation is attempted and how long to wait between
/// attempts. The wait before attempt `n + 1` is `base_delay * 2^(n - 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    let delay = self.delay_after(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        self.max_attempts,
                        err,
                        delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, waiting 1s then 2s.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
