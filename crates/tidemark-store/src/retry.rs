//! Bounded retry with exponential backoff for store contention
//!
//! The connection's busy timeout absorbs short contention inside SQLite;
//! this executor handles contention that outlasts it, at the call-site
//! level, with visibility into how many attempts were made. Retry policy
//! is defined here once instead of being re-invented per call site.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
///
/// Immutable once constructed. The default (3 attempts, 100ms base,
/// doubling, capped at 10s) suits UI-triggered commands where a user is
/// waiting on the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Exponent cap keeping the f64 math finite for any policy values.
    const MAX_EXPONENT: u32 = 32;

    /// The delay to sleep after the 1-based `attempt` failed.
    ///
    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    /// Multipliers below 1.0 are treated as 1.0 so the schedule never
    /// shrinks.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(Self::MAX_EXPONENT) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let scaled_secs = self.base_delay.as_secs_f64() * factor;
        if !scaled_secs.is_finite() || scaled_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled_secs)
        }
    }

    /// At least one attempt always runs.
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op`, retrying transient-busy failures with bounded backoff.
///
/// Any error that is not transient contention returns immediately, on the
/// first attempt it occurs. Exhausting every attempt is reported as
/// [`StoreError::RetriesExhausted`], never silently as the last busy
/// error.
///
/// Blocks the calling thread between attempts; use
/// [`run_with_retry_async`] from async contexts.
pub fn run_with_retry<T, F>(policy: &RetryPolicy, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> StoreResult<T>,
{
    let attempts = policy.attempts();
    for attempt in 1..attempts {
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient_busy() => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, max_attempts = attempts, ?delay, "Store busy, backing off");
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }

    // Final attempt; exhaustion is reported distinctly.
    match op() {
        Ok(value) => {
            if attempts > 1 {
                debug!(attempt = attempts, "Operation succeeded after retrying");
            }
            Ok(value)
        }
        Err(err) if err.is_transient_busy() => Err(StoreError::RetriesExhausted {
            attempts,
            source: Box::new(err),
        }),
        Err(err) => Err(err),
    }
}

/// Async variant of [`run_with_retry`]; sleeps on the runtime's timer
/// instead of blocking a thread.
pub async fn run_with_retry_async<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = policy.attempts();
    for attempt in 1..attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient_busy() => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, max_attempts = attempts, ?delay, "Store busy, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    match op().await {
        Ok(value) => {
            if attempts > 1 {
                debug!(attempt = attempts, "Operation succeeded after retrying");
            }
            Ok(value)
        }
        Err(err) if err.is_transient_busy() => Err(StoreError::RetriesExhausted {
            attempts,
            source: Box::new(err),
        }),
        Err(err) => Err(err),
    }
}
