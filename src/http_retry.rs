//! Retry executor with exponential backoff.
//!
//! Runs an operation once, then up to `max_retries` more times while it
//! fails with an error the caller marked as transient. Delays start at the
//! configured base delay (1s by default) and double after every retry; there
//! is no jitter. When attempts are exhausted the last error is returned
//! unchanged, and fatal errors are returned on the spot.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::types::DropboxError;

/// Errors that know whether they are worth retrying
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for DropboxError {
    fn is_retryable(&self) -> bool {
        DropboxError::is_retryable(self)
    }
}

/// Runs fallible async operations with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    base_delay: Duration,
    backoff_multiplier: u32,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryExecutor {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_multiplier: config.backoff_multiplier.max(1),
        }
    }

    /// Delay slept before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.backoff_multiplier.saturating_pow(retry))
    }

    /// Retry while the error reports itself as retryable
    pub async fn run_with_retry<T, E, F, Fut>(&self, max_retries: u32, op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_retry_if(max_retries, op, |e: &E| e.is_retryable())
            .await
    }

    /// Retry while `should_retry` accepts the error
    pub async fn run_with_retry_if<T, E, F, Fut, P>(
        &self,
        max_retries: u32,
        mut op: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut retries = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !should_retry(&err) || retries >= max_retries {
                return Err(err);
            }

            let delay = self.delay_for(retries);
            retries += 1;
            tracing::warn!(
                "Attempt failed: {}. Retry {}/{} after {:?}",
                err, retries, max_retries, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
