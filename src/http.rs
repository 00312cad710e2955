//! Shared retry policy for network call sites
//!
//! Every call site gets an explicit policy value; there is no hidden retry
//! layered into the clients themselves beyond what these values describe.

use reqwest::StatusCode;
use std::time::Duration;

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Web API calls: 3 attempts, 1s..10s backoff.
    pub fn web_api() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Zeroconf device endpoints: 3 attempts, short backoff. The device is
    /// on the local network and the orchestrator's own deadlines are tight.
    pub fn zeroconf() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Delay before attempt `attempt + 1` (attempt is 1-based, counting the
    /// one that just failed). Doubles per attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = (delay * 2).min(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}

/// Statuses worth another attempt: rate limiting and transient upstream errors.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}
