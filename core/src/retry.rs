//! Bounded exponential backoff for transient failures.

use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::Failure;
use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// `delay = min(base * 2^attempt, cap)`. Only `Transient` outcomes retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(5_000))
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_cap_ms),
        )
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// `retries_done` retries have already happened; `max_retries == 0`
    /// disables retrying.
    pub fn decide<T>(&self, outcome: &Outcome<T>, retries_done: u32, max_retries: u32) -> RetryDecision {
        match outcome {
            Outcome::Transient(_) if retries_done < max_retries => RetryDecision::Retry {
                delay: self.backoff(retries_done),
            },
            _ => RetryDecision::GiveUp,
        }
    }

    /// Fatal detail reported once the retry budget is spent.
    pub fn exhausted(last: Failure, attempts: u32) -> Failure {
        let message = format!("request failed after {attempts} attempts: {}", last.message);
        Failure {
            message,
            attempts,
            ..last
        }
    }
}
