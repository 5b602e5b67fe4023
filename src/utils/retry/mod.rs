//! Resilience policy: bounded retry with exponential backoff.
//!
//! Wraps broker operations (exchange declaration, publish) and handler
//! invocation. Only transient failures are retried; the wait before retry
//! `n` is `base_delay * 2^n`.

use std::future::Future;
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;
use uuid::Uuid;

use crate::bus::{BusError, HandlerError};
use crate::config::RetryConfig;

/// Errors that may succeed when retried.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for BusError {
    fn is_transient(&self) -> bool {
        BusError::is_transient(self)
    }
}

impl Transient for HandlerError {
    fn is_transient(&self) -> bool {
        HandlerError::is_transient(self)
    }
}

/// Retry policy shared by publish and dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResiliencePolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Unit of the backoff: retry `n` waits `base_delay * 2^n`.
    pub base_delay: Duration,
    /// Cap on a single wait.
    pub max_delay: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl From<&RetryConfig> for ResiliencePolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ResiliencePolicy {
    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Wait before retry `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.delay_for_attempt(1))
            .with_factor(2.0)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }

    /// Run `operation`, retrying transient failures. Each retry is logged
    /// with its wait, the time spent so far and the event id.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &'static str,
        event_id: Uuid,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let started = Instant::now();
        f.retry(self.backoff())
            .when(|e: &E| e.is_transient())
            .notify(|e: &E, delay: Duration| {
                warn!(
                    operation,
                    event_id = %event_id,
                    delay_ms = delay.as_millis() as u64,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
            })
            .await
    }
}

/// Backoff between consumer rebuild attempts, with jitter to avoid
/// every consumer reconnecting at once.
///
/// Callers fall back to 30 seconds once the iterator is exhausted.
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter()
}
