//! Step retry policy with configurable backoff and jitter.
//!
//! The defaults reproduce the plain "sleep `backoff` seconds between
//! attempts" behaviour: constant backoff, no jitter, one attempt.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base (constant)
    #[default]
    Constant,
    /// delay = base * attempt
    Linear,
    /// delay = base * 2^(attempt - 1)
    Exponential,
}

/// Jitter strategy applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Retry policy of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    #[serde(alias = "attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in seconds.
    #[serde(alias = "backoff")]
    pub backoff_seconds: f64,
    /// Upper bound for a single delay in seconds.
    pub max_backoff_seconds: f64,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_seconds: 0.0,
            max_backoff_seconds: 300.0,
            strategy: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with a single attempt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy with `attempts` attempts and a constant backoff.
    #[must_use]
    pub fn attempts(attempts: u32, backoff: Duration) -> Self {
        Self::default()
            .with_max_attempts(attempts)
            .with_backoff(backoff)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_seconds = backoff.as_secs_f64();
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempts actually allowed. A zero in the configuration still runs
    /// the step once.
    #[must_use]
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Returns true if another attempt may follow `attempt` (1-based).
    #[must_use]
    pub fn has_attempts_after(&self, attempt: u32) -> bool {
        attempt < self.effective_attempts()
    }

    /// Delay to sleep after the failed `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = sanitize(self.backoff_seconds);
        let max = sanitize(self.max_backoff_seconds).max(base);
        let n = attempt.max(1);

        let delay = match self.strategy {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base * f64::from(n),
            BackoffStrategy::Exponential => base * 2f64.powi(i32::try_from(n - 1).unwrap_or(i32::MAX)),
        }
        .min(max);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay <= 0.0 {
                    0.0
                } else {
                    rand::thread_rng().gen_range(0.0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2.0;
                if half <= 0.0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0.0..=half)
                }
            }
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(Duration::MAX)
    }
}

fn sanitize(seconds: f64) -> f64 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    }
}
