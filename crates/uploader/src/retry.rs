//! Bounded retry against the session-wide failure counter.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::Operation;
use crate::session::{SessionCore, Shared};

/// Retry rule shared by every backend call of a session.
///
/// One counter covers all operation kinds: a failure increments it, any
/// success resets it, and exceeding `limit` ends the operation with
/// [`UploadError::RetryLimitExceeded`] (resetting the counter).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    limit: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(limit: u32, delay: Duration) -> Self {
        Self { limit, delay }
    }

    pub fn from_config(config: &UploaderConfig) -> Self {
        Self::new(config.retry_limit, config.retry_timeout())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Counts one failure. Returns `true` when the limit is exceeded.
    pub fn record_failure(&self, core: &mut SessionCore) -> bool {
        core.retry_count += 1;
        if core.retry_count > self.limit {
            core.retry_count = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(core: &mut SessionCore) {
        core.retry_count = 0;
    }

    /// Runs `attempt` until it succeeds, fails terminally, or exhausts the
    /// shared counter. Waits the fixed delay between attempts.
    pub async fn run<T, F, Fut>(
        &self,
        shared: &Shared,
        cancel: &CancellationToken,
        operation: Operation,
        mut attempt: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        loop {
            let result = cancellable(cancel, attempt()).await;
            let err = match result {
                Ok(value) => {
                    Self::record_success(&mut shared.core());
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            let exhausted = self.record_failure(&mut shared.core());
            if exhausted {
                error!(operation = %operation, error = %err, "retry limit exceeded");
                return Err(UploadError::RetryLimitExceeded {
                    operation,
                    chunk: None,
                    source: Box::new(err),
                });
            }
            warn!(
                operation = %operation,
                error = %err,
                delay_ms = self.delay.as_millis() as u64,
                "operation failed; retrying"
            );
            sleep(self.delay, cancel).await?;
        }
    }
}

/// Awaits `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, UploadError>>,
) -> Result<T, UploadError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        result = fut => result,
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub(crate) async fn sleep(delay: Duration, cancel: &CancellationToken) -> Result<(), UploadError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
