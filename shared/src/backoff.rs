//! Reconnect delay policy
//!
//! The delay grows linearly with the attempt count and is capped:
//! `min(base * attempt, max)`.

use std::time::Duration;

use crate::link;

/// Linear-times-attempt reconnect backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(link::RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(link::RECONNECT_MAX_DELAY_MS),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(attempt.max(1))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
