//! Bounded retry for any fallible async operation.
//!
//! The delay between attempts comes from a [`Backoff`], a function of the
//! attempt number. The default is a flat delay; exponential growth with a cap
//! is available for callers that need it. After the last attempt the final
//! error is returned to the caller unchanged.

use fourd_types::config::{BackoffKind, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^n` after the n-th failure (0-indexed), capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to sleep after the failure of attempt `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// How many times to call an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls, including the first. Zero is treated as one.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Exponential { base, max },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let delay = Duration::from_millis(config.delay_ms);
        match config.backoff {
            BackoffKind::Fixed => Self::fixed(config.attempts, delay),
            BackoffKind::Exponential => Self::exponential(
                config.attempts,
                delay,
                Duration::from_millis(config.max_delay_ms),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry functions
// ---------------------------------------------------------------------------

/// Call `operation` until it succeeds or `policy.attempts` calls have failed.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(policy, operation, |_| true).await
}

/// Like [`retry`], but stops early when `should_retry` rejects an error.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Retry succeeded");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt + 1 >= max {
                    warn!(attempt = attempt + 1, max_attempts = max, error = %err, "All retry attempts exhausted");
                    return Err(err);
                }
                if !should_retry(&err) {
                    debug!(attempt = attempt + 1, error = %err, "Error is not retryable");
                    return Err(err);
                }
                let delay = policy.backoff.delay(attempt);
                debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "Retrying after error");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
