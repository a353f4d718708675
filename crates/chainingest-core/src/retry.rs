//! Exponential backoff for node calls and handler applications.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, IndexerError};

/// Configuration for a retry policy. Durations are in milliseconds so the
/// struct can be read straight from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Cap on the exponential growth.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A policy that never waits; used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Run a node call with a per-attempt timeout, retrying transient failures.
///
/// Non-retryable errors are returned immediately; once the retry ceiling is
/// reached the last error is wrapped in [`IndexerError::RetriesExhausted`].
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &str,
    mut call: F,
) -> Result<T, IndexerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(r) => r,
            Err(_) => Err(ClientError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e.into()),
            Err(e) => e,
        };

        attempt += 1;
        match policy.next_delay(attempt) {
            Some(delay) => {
                tracing::warn!(operation, attempt, ?delay, error = %err, "node call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            None => {
                return Err(IndexerError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: err,
                })
            }
        }
    }
}
