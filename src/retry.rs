//! Backoff schedule for the per-record publish retry wrapper.

use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per record per tick, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt (doubles on each retry)
    pub base_delay: Duration,
    /// Upper bound on a single delay
    pub max_delay: Duration,
    /// Randomize each delay by ±25%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            delay.mul_f64(factor).min(self.max_delay)
        } else {
            delay
        }
    }
}
