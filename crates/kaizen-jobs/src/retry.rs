//! Retry policy for failed tasks.
//!
//! A task that fails is usually racing a commit it depends on, so the
//! default is to wait a fixed delay and try again. The policy cannot tell a
//! race from a permanent error, so it is bounded unless an operator opts in
//! to [`RetryPolicy::unbounded`].

use std::time::Duration;

use kaizen_core::{defaults, KaizenConfig};

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the job claimable again after this delay.
    Retry { after: Duration },
    /// Stop trying and mark the job failed.
    GiveUp,
}

/// Delay and ceiling for retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first; `None` = unbounded.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Multiplier applied to the delay for each further retry.
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(defaults::JOB_MAX_ATTEMPTS),
            delay: Duration::from_secs(defaults::JOB_RETRY_DELAY_SECS),
            backoff: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Retry forever with the default delay.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }

    pub fn from_config(config: &KaizenConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: Duration::from_secs(config.retry_delay_secs),
            backoff: 1.0,
        }
    }

    pub fn with_max_attempts(mut self, max: Option<u32>) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff.max(1.0);
        self
    }

    /// Decide after the `failures`-th failed attempt (1-based).
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if let Some(max) = self.max_attempts {
            if failures >= max {
                return RetryDecision::GiveUp;
            }
        }
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let secs = self.delay.as_secs_f64() * self.backoff.powi(exponent);
        RetryDecision::Retry {
            after: Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX),
        }
    }
}
