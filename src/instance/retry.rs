//! Bounded retry with exponential backoff for runtime calls.

use crate::error::RuntimeError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Done(T),
    /// Last error plus the number of attempts made
    Failed { error: RuntimeError, attempts: u32 },
    Cancelled,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis((delay as u64).min(self.max_delay_ms))
    }

    /// Backoff with up to 25% random jitter added.
    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let spread = (delay.as_millis() as u64) / 4;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// exhausts the attempt budget, or `cancel` fires.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                result = operation(attempt) => result,
            };

            match result {
                Ok(value) => return RetryOutcome::Done(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.jittered(attempt);
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, max_attempts, error, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
