// src/runtime/retry.rs
//! Bounded retry with a fixed delay
//!
//! Only errors classified as retryable are attempted again. The delay between
//! attempts is interruptible through the runner's cancellation token, which is
//! how shutdown cuts a pending retry short.

use crate::utils::errors::Retryable;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many times to try and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt; zero is treated as one
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Executes fallible async operations under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryRunner {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryRunner {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or the runner is cancelled while waiting. Returns the last error.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 1;

        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", what, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!("{} failed permanently: {}", what, err);
                return Err(err);
            }

            if attempt >= self.policy.max_attempts {
                warn!("{} failed after {} attempts: {}", what, attempt, err);
                return Err(err);
            }

            debug!(
                attempt,
                "{} failed, retrying in {:?}: {}", what, self.policy.delay, err
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("{} retry cancelled after {} attempts", what, attempt);
                    return Err(err);
                }
                _ = tokio::time::sleep(self.policy.delay) => {}
            }

            attempt += 1;
        }
    }
}
