//! Bounded retry for one-shot supervisor lookups.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::common::error::RetryError;

/// How often and how patiently to retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first one.
    pub attempts: usize,
    /// Pause between attempts. Zero retries back to back.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: usize, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.attempts.max(1) - 1)
    }
}

/// Run `operation` until it succeeds or `policy.attempts` invocations failed.
///
/// Cancellation wins over any remaining attempts, including one in flight.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &'static str,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts.max(1);
    let retrying = op
        .retry(policy.backoff())
        .notify(|e: &E, delay: Duration| {
            warn!(
                "{} failed, retrying in {} milliseconds: {}",
                operation,
                delay.as_millis(),
                e
            );
        });

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RetryError::Cancelled { operation }),
        result = retrying => result.map_err(|source| RetryError::Exhausted {
            operation,
            attempts,
            source,
        }),
    }
}
