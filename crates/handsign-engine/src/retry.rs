use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Retry settings for one class of transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Upper bound on the whole operation, sleeps included.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Message sends, edits, photo uploads and downloads.
    pub const SEND: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(1),
        timeout: Duration::from_secs(60),
    };

    /// Callback acknowledgements: latency-sensitive, less critical to land.
    pub const ACK: Self = Self {
        max_retries: 2,
        initial_delay: Duration::from_millis(500),
        timeout: Duration::from_secs(10),
    };

    /// Delay before retry number `attempt + 1`: `initial_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Runs transport operations with exponential backoff. Sleeps end early when
/// the shared cancellation token fires.
#[derive(Clone)]
pub struct RetryExecutor {
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        policy: RetryPolicy,
        op_name: &str,
        op: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        match tokio::time::timeout(policy.timeout, self.run(policy, op_name, op)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}", op_name, policy.timeout);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn run<T, F, Fut>(
        &self,
        policy: RetryPolicy,
        op_name: &str,
        mut op: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_retryable() {
                debug!("{} failed permanently: {}", op_name, err);
                return Err(err);
            }
            if attempt >= policy.max_retries {
                warn!("{} failed after {} attempts: {}", op_name, attempt + 1, err);
                return Err(err);
            }

            let mut delay = policy.delay_for(attempt);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }
            debug!(
                "{} attempt {} failed ({}), retrying in {:?}",
                op_name,
                attempt + 1,
                err,
                delay
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
