//! Call-site retry for transient persistence failures.
//!
//! The delay for attempt `n` (0-indexed) is `first × 2^n`, capped at
//! [`MAX_DELAY`]. Only errors reported by [`AppError::is_transient`] are
//! retried; everything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::PersistenceConfig;
use crate::{AppError, Result};

/// Upper bound for a single backoff delay.
pub const MAX_DELAY: Duration = Duration::from_secs(5);

/// Retry parameters for persistence calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    /// Delay before the first retry.
    pub first: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PersistenceConfig::default())
    }
}

impl From<&PersistenceConfig> for RetryPolicy {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            first: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.first.saturating_mul(factor).min(MAX_DELAY)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `op`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt, ?delay, %err, "transient persistence failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(exhausted(what, err)),
            }
        }
    }
}

fn exhausted(what: &str, err: AppError) -> AppError {
    match err {
        AppError::Db(msg) => AppError::Db(format!("{what}: {msg}")),
        AppError::DbRejected(msg) => AppError::DbRejected(format!("{what}: {msg}")),
        other => other,
    }
}
