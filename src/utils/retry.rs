//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Only storage
//! contention is retried; validation and precondition failures surface
//! on the first attempt.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use tracing::{error, warn};

use crate::services::{BillingError, ErrorKind};

/// Bounds for internal retry on storage contention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub min_delay_ms: u64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
    /// Retries after the initial attempt.
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 500,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Short delays and more attempts, for heavily contended tests.
    pub fn for_test() -> Self {
        Self {
            min_delay_ms: 1,
            max_delay_ms: 20,
            max_attempts: 20,
        }
    }

    /// Backoff for storage-conflict retries.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_attempts)
            .with_jitter()
    }
}

/// Determines if a billing error is retryable (storage contention only).
///
/// Every effectful operation is idempotent per payment ID or guarded by a
/// uniqueness constraint, so a conflicted unit can always be re-run.
pub fn is_retryable(err: &BillingError) -> bool {
    matches!(err, BillingError::StorageConflict(_))
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the
/// configured attempts are exhausted.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    attempt: F,
) -> Result<T, BillingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BillingError>>,
{
    attempt
        .retry(config.backoff())
        .when(is_retryable)
        .notify(|err: &BillingError, dur: Duration| {
            warn!(operation, error = %err, delay = ?dur, "Storage conflict, retrying");
        })
        .await
        .inspect_err(|err| {
            if matches!(err.kind(), ErrorKind::Internal | ErrorKind::StorageConflict) {
                error!(operation, error = %err, "Storage failure surfaced to caller");
            }
        })
}
