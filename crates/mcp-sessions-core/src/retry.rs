//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for transient failures and storage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), doubling each time and
    /// capped at `max_delay`, with up to 25% random jitter added.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.min(20);
        let backoff = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exp))
            .min(self.max_delay);
        let jitter_budget = backoff.as_millis() as u64 / 4;
        let jitter = if jitter_budget == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_budget)
        };
        backoff.saturating_add(Duration::from_millis(jitter))
    }

    /// Whether another retry is allowed after `retry` failed attempts.
    #[must_use]
    pub const fn retries_left(&self, retry: u32) -> bool {
        retry + 1 < self.max_attempts
    }
}
