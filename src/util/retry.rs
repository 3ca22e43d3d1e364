//! Retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StrandError;

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Upper bound for computed delays.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Computed backoff for the given 1-based retry attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay for a retry, preferring a server-provided hint over the computed backoff.
    pub fn delay_for(&self, attempt: u32, hint_ms: Option<u64>) -> Duration {
        match hint_ms {
            Some(hint) if hint > 0 => Duration::from_millis(hint),
            _ => self.backoff_delay(attempt),
        }
    }

    /// Execute an async operation, retrying errors classified as retryable.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, StrandError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StrandError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = self.delay_for(attempt, e.retry_after_ms());

                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after error"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn server_hint_overrides_computed_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(9_000)),
            Duration::from_millis(9_000)
        );
        assert_eq!(policy.delay_for(1, Some(0)), policy.backoff_delay(1));
        assert_eq!(policy.delay_for(2, None), policy.backoff_delay(2));
    }
}
