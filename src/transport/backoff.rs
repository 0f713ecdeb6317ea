use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Exponential reconnect delay: initial, doubling, capped at the maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            initial: policy.initial_backoff(),
            max: policy.max_backoff(),
            max_attempts: policy.max_attempts,
            attempt: 0,
        }
    }

    /// Record a failed attempt. Returns the delay before the next one, or
    /// `None` once the attempt cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.max_attempts != 0 && self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << (self.attempt - 1).min(16);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    /// Consecutive failures so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
