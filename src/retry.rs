//! Retry combinator shared by navigation and session-store writes.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    /// `step`, `2 * step`, `3 * step`, ...
    Linear {
        #[serde(with = "humantime_serde")]
        step: Duration,
    },
    /// `initial * multiplier^n`, capped at `max`.
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Three attempts, waiting 1s then 2s between them.
    pub fn navigation() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_secs(1),
            },
        }
    }

    pub fn store_write() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_millis(100),
            },
        }
    }

    /// Policy that never waits; used where retries must not slow tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear {
                step: Duration::ZERO,
            },
        }
    }

    /// Delay after the zero-based `attempt` has failed.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        match self.backoff {
            Backoff::Linear { step } => step * (attempt as u32 + 1),
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let millis = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
                Duration::from_millis(millis as u64).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::navigation()
    }
}

/// Runs `operation` until it succeeds, `should_retry` rejects the error, or
/// `policy.max_attempts` is used up. The operation receives the zero-based
/// attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt + 1 >= attempts || !should_retry(&e) {
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                debug!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt + 1,
                    attempts,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
