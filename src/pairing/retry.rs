//! Caller-side retry of transactions that lost a race.
//!
//! The engine never retries on its own. This wraps an operation and re-runs
//! it from the top, with exponential backoff and jitter, only when it fails
//! with [`SessionError::ConcurrencyAborted`]. Precondition failures and
//! store errors are returned on the first attempt.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Configuration for abort retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (milliseconds).
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) - randomness added to delay.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 20,
            max_delay_ms: 500,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`, plus up to
    /// `jitter_factor * delay` of random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp_delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped_delay_ms = exp_delay_ms.min(self.max_delay_ms);

        let jitter_range = (capped_delay_ms as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped_delay_ms.saturating_add(jitter))
    }
}

/// Counters for transaction attempts made through [`retry_on_abort`].
#[derive(Debug, Default)]
pub struct TransactionMetrics {
    /// Every attempt, including retries.
    pub attempts: AtomicU64,
    /// Operations that eventually succeeded.
    pub committed: AtomicU64,
    /// Attempts that ended in a concurrency abort.
    pub aborted: AtomicU64,
    /// Operations that were still aborting when retries ran out.
    pub exhausted: AtomicU64,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransactionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub committed: u64,
    pub aborted: u64,
    pub exhausted: u64,
}

/// Run `operation`, re-running it while it ends in a concurrency abort.
pub async fn retry_on_abort<F, Fut, T>(
    config: &RetryConfig,
    metrics: &TransactionMetrics,
    op: &str,
    operation: F,
) -> Result<T, SessionError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    let mut retry = 0u32;
    loop {
        metrics.attempts.fetch_add(1, Ordering::Relaxed);
        match operation().await {
            Ok(value) => {
                metrics.committed.fetch_add(1, Ordering::Relaxed);
                if retry > 0 {
                    tracing::debug!(op, attempts = retry + 1, "Transaction succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                metrics.aborted.fetch_add(1, Ordering::Relaxed);
                if retry >= config.max_retries {
                    metrics.exhausted.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(op, attempts = retry + 1, "Transaction retries exhausted");
                    return Err(err);
                }
                let delay = config.delay_for(retry);
                tracing::debug!(
                    op,
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transaction aborted, retrying"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
