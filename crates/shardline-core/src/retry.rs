//! Retry with exponential backoff for object-store transfers
//!
//! Shard downloads hit remote storage and fail transiently (timeouts,
//! dropped connections). Those are retried with jittered exponential
//! backoff. Anything [`Error::is_retryable`] rejects fails immediately.
//!
//! ```rust,ignore
//! use shardline_core::retry::{retry_async, RetryPolicy};
//!
//! let bytes = retry_async(&RetryPolicy::default(), || store.download(&key, &dest)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: usize,
    pub initial_delay: Duration,
    /// Caps exponential growth
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let base =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * self.jitter_factor;
        Duration::from_millis((capped * jitter) as u64)
    }
}

/// Retries `operation` while it fails with a retryable [`Error`]
pub async fn retry_async<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_if(policy, operation, Error::is_retryable).await
}

/// Retries `operation` while `should_retry` accepts the error
pub async fn retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt < policy.max_retries && should_retry(&error) => {
                let delay = policy.backoff_delay(attempt);
                attempt += 1;
                debug!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                if attempt > 0 {
                    warn!(attempts = attempt + 1, error = %error, "Giving up after retries");
                }
                return Err(error);
            }
        }
    }
}
