//! Dial retry with exponential backoff and jitter.
//!
//! Outbound connects go through [`retry_async`] so a gate that is still
//! starting up (or briefly unreachable) does not fail the first `connect`.

use netron_types::config::ConnectConfig;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// How dial attempts are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = none). The sleep is `delay * (1 + r * jitter)`.
    pub jitter: f64,
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ConnectConfig::default())
    }
}

impl From<&ConnectConfig> for RetryPolicy {
    fn from(config: &ConnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter: config.jitter,
        }
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// The successful result.
        result: T,
        /// Attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// Every attempt failed, or the error was not retryable.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        /// Attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Collapse into a plain `Result`.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Success { result, .. } => Ok(result),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Delay before retry number `attempt` (0-indexed).
///
/// `min(initial * 2^attempt, max) * (1 + random * jitter)`, clamped to `max`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let base = policy
        .initial_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(policy.max_delay_ms);

    if policy.jitter <= 0.0 {
        return capped;
    }

    let frac: f64 = rand::thread_rng().gen();
    let with_jitter = (capped as f64) + (capped as f64) * frac * policy.jitter;
    (with_jitter as u64).min(policy.max_delay_ms)
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// policy's attempts are used up.
pub async fn retry_async<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Retry succeeded");
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                let retryable = should_retry(&err);
                if attempt + 1 >= max || !retryable {
                    if retryable {
                        warn!(attempts = attempt + 1, error = %err, "All retry attempts exhausted");
                    } else {
                        debug!(attempt = attempt + 1, error = %err, "Error is not retryable");
                    }
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }

                let delay_ms = compute_backoff(policy, attempt);
                debug!(attempt = attempt + 1, delay_ms, error = %err, "Retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}
