//! Retry policy
//!
//! Attempt `n` of a retryable failure waits `n * retry_modifier` before the
//! next try. The number of attempts is the smaller of what the error allows
//! and the pool-wide ceiling.

use crate::config::RetryConfig;
use crate::error::TaskError;
use std::time::Duration;

/// Outcome of consulting the policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep this long, then try again
    Retry(Duration),
    /// The failure is final
    GiveUp,
}

impl RetryDecision {
    /// True when another attempt should be made
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    /// Delay before the next attempt, zero when giving up
    pub fn delay(&self) -> Duration {
        match self {
            Self::Retry(delay) => *delay,
            Self::GiveUp => Duration::ZERO,
        }
    }
}

/// Linear backoff bounded by a global attempt ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    ceiling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Policy with an explicit attempt ceiling
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling: ceiling.max(1),
        }
    }

    /// Policy from the engine retry settings
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts)
    }

    /// Global attempt ceiling
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Attempts allowed for this error
    pub fn max_attempts(&self, err: &TaskError) -> u32 {
        err.retry_max.min(self.ceiling).max(1)
    }

    /// Decide what happens after `attempt` (1-based) failed with `err`
    pub fn should_retry(&self, err: &TaskError, attempt: u32) -> RetryDecision {
        if err.can_retry && attempt < self.max_attempts(err) {
            RetryDecision::Retry(backoff(err.retry_modifier, attempt))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Linear backoff: `attempt * modifier`
pub fn backoff(modifier: Duration, attempt: u32) -> Duration {
    modifier.saturating_mul(attempt)
}
