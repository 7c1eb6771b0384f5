//! Retry policy: error classification and bounded exponential backoff.
//!
//! Attempts move through [`RetryState`]:
//!
//! ```text
//! Idle -> Attempting -> Succeeded
//!                    -> Retrying -> Attempting ...
//!                    -> Exhausted
//! ```
//!
//! Fatal errors go straight to `Exhausted`. Transient errors retry until
//! `max_retries` retries have been spent, after which the last error surfaces.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection failures, server-side errors, throttling.
    Transient,
    /// Everything else.
    Fatal,
}

/// Errors that know their own retry class.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Position of a call in the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryState {
    Idle,
    /// Attempt number `attempt` (0-based) is in flight.
    Attempting { attempt: u32 },
    /// Waiting `delay` before attempt `attempt + 1`.
    Retrying { attempt: u32, delay: Duration },
    Succeeded,
    Exhausted,
}

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied per retry.
    pub factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the computed delay (0 disables).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_secs(5),
            factor: 2.0,
            max_delay: Duration::from_secs(600),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): `base × factor^retry`,
    /// capped at `max_delay`, plus jitter.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            capped * (1.0 + rand::random::<f64>() * self.jitter)
        } else {
            capped
        };
        if jittered.is_finite() && jittered > 0.0 {
            Duration::from_secs_f64(jittered)
        } else {
            Duration::ZERO
        }
    }

    /// State after attempt `attempt` failed with an error of class `class`.
    #[must_use]
    pub fn on_failure(&self, attempt: u32, class: ErrorClass) -> RetryState {
        match class {
            ErrorClass::Transient if attempt < self.max_retries => RetryState::Retrying {
                attempt,
                delay: self.delay_for(attempt),
            },
            _ => RetryState::Exhausted,
        }
    }

    /// Runs `call` until it succeeds, fails fatally, or runs out of retries.
    ///
    /// `call` receives the 0-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last error once the policy gives up.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        E: Classify + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match call(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let class = e.class();
                    if let RetryState::Retrying { delay, .. } = self.on_failure(attempt, class) {
                        metrics::counter!("colander.retry.attempts", "operation" => operation.to_string())
                            .increment(1);
                        warn!(
                            operation,
                            attempt = attempt + 1,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        if class == ErrorClass::Transient {
                            warn!(operation, retries = self.max_retries, error = %e, "retries exhausted");
                        } else {
                            debug!(operation, error = %e, "fatal failure, not retrying");
                        }
                        return Err(e);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
