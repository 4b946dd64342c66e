//! Bounded retry with exponential backoff for remote calls.
//!
//! Every attempt runs under its own timeout; an elapsed timeout counts as a
//! transient failure. Non-transient errors are returned immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::SyncConfig;
use crate::errors::{RemoteError, SyncError};

/// Retry settings for one class of remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline applied to each individual attempt.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(sync: &SyncConfig, call_timeout: Duration) -> Self {
        Self {
            max_attempts: sync.max_attempts.max(1),
            base_delay: Duration::from_millis(sync.backoff_base_ms),
            max_delay: Duration::from_millis(sync.backoff_max_ms),
            call_timeout,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `f` until it succeeds, fails permanently, or runs out of attempts.
pub async fn retry_async<F, Fut, T>(
    op_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = RemoteError::Transient(format!("{op_name}: no attempt made"));

    for attempt in 0..attempts {
        let outcome = match tokio::time::timeout(policy.call_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(policy.call_timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(SyncError::Remote(e)),
            Err(e) => {
                last_err = e;
                if attempt + 1 < attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        operation = op_name,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_err,
                        "remote call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(SyncError::RetriesExhausted {
        operation: op_name.to_string(),
        attempts,
        last: last_err,
    })
}
