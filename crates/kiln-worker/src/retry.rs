//! Bounded retry with exponential backoff

use backon::{ExponentialBuilder, Retryable};
use kiln_core::{Error, Result, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often, and how patiently, to repeat a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` counts the first try and is at least 1
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// A single attempt, no retries
    pub fn never() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Policy for the registration call
    pub fn for_register(config: &RetryConfig) -> Self {
        Self::new(
            config.register_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Policy for each submission
    pub fn for_submit(config: &RetryConfig) -> Self {
        Self::new(
            config.submit_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff schedule: doubling from the initial delay up to the cap, with
    /// one retry fewer than the attempt budget
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        op.retry(self.backoff())
            .when(Error::is_retryable)
            .notify(|err: &Error, dur: Duration| {
                warn!(
                    operation,
                    error = %err,
                    "Retrying in {:.1}s",
                    dur.as_secs_f32()
                );
            })
            .await
    }
}
