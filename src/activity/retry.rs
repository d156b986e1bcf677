//! Retry Policy
//!
//! Bounded retries with exponential backoff. Attempts are 1-based: the
//! attempt numbered `maximum_attempts` is the last one scheduled.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry behaviour for an activity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total executions allowed, including the first
    pub maximum_attempts: u32,

    /// Delay before the second attempt
    #[serde(rename = "initial_interval_ms", with = "crate::config::duration_ms")]
    pub initial_interval: Duration,

    /// Multiplier applied to the delay after each attempt
    pub backoff_coefficient: f64,

    /// Upper bound on any single delay
    #[serde(rename = "maximum_interval_ms", with = "crate::config::duration_ms")]
    pub maximum_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(maximum_attempts: u32) -> Self {
        Self {
            maximum_attempts,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self::new(1)
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = interval;
        self
    }

    /// Returns true if another attempt may follow `attempt`.
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.maximum_attempts
    }

    /// Delay to wait after the failed `attempt` before the next one.
    ///
    /// `initial_interval * backoff_coefficient^(attempt - 1)`, capped at
    /// `maximum_interval`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let secs = self.initial_interval.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.maximum_interval.as_secs_f64() {
            return self.maximum_interval;
        }
        Duration::from_secs_f64(secs)
    }
}
