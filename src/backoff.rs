//! Exponential backoff for network-sensitive operations.
//!
//! Delays follow `min(initial_delay * factor^attempt, max_delay)`. Retries
//! are driven by the `backon` crate without jitter, so the schedule is
//! deterministic and matches [`BackoffPolicy::delay`].
//!
//! When every attempt fails, the error from the final attempt is returned
//! as-is, never wrapped in a "retries exhausted" error.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};

use crate::error::{RelayError, Result};

/// Retry schedule for downloads and remote calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub factor: f32,
    pub max_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let raw_ms = self.initial_delay.as_millis() as f64 * (self.factor as f64).powi(attempt as i32);
        Duration::from_millis(raw_ms.min(max_ms) as u64)
    }

    /// The full delay schedule, one entry per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay(attempt))
    }

    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_factor(self.factor)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize)
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent.
    ///
    /// Only errors for which [`RelayError::is_retryable`] holds are retried.
    pub async fn retry<T, F, Fut>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_with(label, operation, |_| {}).await
    }

    /// [`retry`](Self::retry), calling `on_retry` with each delay before it
    /// is slept.
    pub async fn retry_with<T, F, Fut, R>(&self, label: &str, operation: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(Duration),
    {
        let attempt_counter = AtomicU32::new(0);
        let mut operation = operation;

        let result = (|| {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!("{} retry attempt {}", label, current_attempt);
            }
            operation()
        })
        .retry(self.builder())
        .when(|e: &RelayError| {
            let retryable = e.is_retryable();
            if !retryable {
                warn!("{} failed with non-retryable error: {}", label, e);
            }
            retryable
        })
        .notify(|err: &RelayError, dur: Duration| {
            warn!("{} failed: {}. Retrying in {:?}", label, err, dur);
            on_retry(dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        match &result {
            Ok(_) if total_attempts > 1 => {
                info!(
                    "{} succeeded after {} retry attempt(s)",
                    label,
                    total_attempts - 1
                );
            }
            Err(e) => {
                error!(
                    "{} failed after {} attempt(s). Last error: {}",
                    label, total_attempts, e
                );
            }
            _ => {}
        }
        result
    }
}
