//! Retry with exponential backoff, and per-call timeouts.
//!
//! Only errors whose [`ErrorClass`] is retryable are retried. Validation and
//! not-found failures return immediately on the first attempt.

use crate::error::{BackendError, ErrorClass, IndexError, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Anything that can report its error class.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        StoreError::class(self)
    }
}

impl Classify for IndexError {
    fn class(&self) -> ErrorClass {
        IndexError::class(self)
    }
}

impl Classify for BackendError {
    fn class(&self) -> ErrorClass {
        BackendError::class(self)
    }
}

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first; `0` behaves like `1`.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 8000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Classify + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let backoff = policy.delay_for(attempt);
                info!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(operation, attempt, class = %e.class(), error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}

/// Bound `fut` by `limit`; `None` waits indefinitely. A timeout is mapped
/// through `on_timeout` into the caller's error type.
pub async fn with_timeout<T, E, Fut>(
    limit: Option<Duration>,
    fut: Fut,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(limit)),
        },
        None => fut.await,
    }
}
