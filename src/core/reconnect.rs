use std::time::Duration;

use super::types::ReconnectStrategy;

/// Fixed-delay reconnect with an attempt ceiling.
///
/// This is the agent backend's default: every retry waits the same delay, and once `max_attempts`
/// reconnects have been scheduled without a successful open the actor gives up and reports a
/// final disconnection.
#[derive(Clone, Debug)]
pub struct FixedDelayReconnect {
    delay: Duration,
    max_attempts: u32,
}

impl FixedDelayReconnect {
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(3000);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for FixedDelayReconnect {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY, Self::DEFAULT_MAX_ATTEMPTS)
    }
}

impl ReconnectStrategy for FixedDelayReconnect {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}

    fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
