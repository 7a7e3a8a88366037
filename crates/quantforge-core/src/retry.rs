//! Bounded retry for registry uploads.
//!
//! Failed attempt `n` (0-based) waits `base_delay * 2^n` before the next one.
//! Only errors that [`QuantError::is_retryable`] classifies as transient are
//! retried; anything else is returned after the attempt that produced it.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::error::{QuantError, Result};

/// How many times an upload is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// 3 attempts, sleeping 1 s then 2 s.
    pub fn upload() -> Self {
        Self {
            max_attempts: RegistryConfig::UPLOAD_MAX_ATTEMPTS,
            base_delay: RegistryConfig::UPLOAD_BASE_DELAY,
        }
    }

    /// Wait after failed attempt `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// What a retried operation cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u32,
    /// Time spent sleeping between attempts.
    pub waited: Duration,
}

/// Run `operation` under `policy`.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut stats = RetryStats::default();

    loop {
        let attempt = stats.attempts;
        stats.attempts += 1;

        let e = match operation().await {
            Ok(value) => return (Ok(value), stats),
            Err(e) => e,
        };
        if !e.is_retryable() {
            debug!("Not retrying: {}", e);
            return (Err(e), stats);
        }
        if stats.attempts >= max_attempts {
            warn!("Giving up after {} attempts: {}", stats.attempts, e);
            return (Err(e), stats);
        }

        let delay = policy.delay_after(attempt);
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            stats.attempts, max_attempts, e, delay
        );
        tokio::time::sleep(delay).await;
        stats.waited += delay;
    }
}
