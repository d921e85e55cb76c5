//! Bounded retry with exponential backoff for external API calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{FailureClass, MigrateError, Result};

/// Retry policy shared by the collector and migrator.
///
/// Only [`FailureClass::Transient`] errors are retried. Every attempt runs
/// under `request_timeout`; an elapsed timeout counts as a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt; doubled for each one after.
    pub base_delay: Duration,

    /// Backoff ceiling.
    pub max_delay: Duration,

    /// Per-attempt timeout.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base and maximum backoff delays.
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Backoff before retrying after `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let computed = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        match hint {
            Some(h) if h > computed => h.min(self.max_delay),
            _ => computed,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.request_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(MigrateError::Timeout {
                    operation: operation.to_string(),
                    after: self.request_timeout,
                }),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if err.class() != FailureClass::Transient {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                return Err(MigrateError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.backoff(attempt, err.retry_after());
            warn!(
                "{} failed ({}), retry {}/{} in {:?}",
                operation,
                err,
                attempt,
                self.max_attempts - 1,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
