//! Bounded exponential-backoff retry for exchange I/O

use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::errors::{BotError, BotResult};

/// Retry bounds shared by the HTTP provider and the signer gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay_ms,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(2u64.saturating_pow(attempt - 1)))
    }

    /// Execute with exponential backoff retry.
    ///
    /// Returns the last error reason wrapped in `BotError::SubmissionFailed`
    /// once all attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, what: &str, operation: F) -> BotResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BotResult<T>>,
    {
        let mut attempts = 0;
        let mut last_error = BotError::Gateway("no attempt made".into());

        while attempts < self.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempts += 1;
                    last_error = e;

                    if attempts < self.max_retries {
                        let delay = self.delay(attempts);
                        warn!(
                            "{} failed (attempt {}/{}), retrying in {}ms: {}",
                            what,
                            attempts,
                            self.max_retries,
                            delay.as_millis(),
                            last_error
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(BotError::SubmissionFailed {
            attempts: self.max_retries,
            reason: last_error.to_string(),
        })
    }
}
