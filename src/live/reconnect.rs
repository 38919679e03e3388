//! Reconnect budget
//!
//! Linear backoff: the n-th retry waits `n * base`. Once the attempt counter
//! reaches the ceiling no further retry is scheduled; the counter only resets
//! on a successful authentication or an explicit disconnect.

use std::time::Duration;

use crate::config::ManagerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Retries up to this number are surfaced as notices
    pub announce_first: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry {
        attempt: u32,
        delay: Duration,
        announce: bool,
    },
    /// The budget ran out on this attempt
    GiveUp {
        attempts: u32,
    },
    /// The budget was already spent before this call
    Exhausted {
        attempts: u32,
    },
}

impl ReconnectPolicy {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.reconnect_base_delay,
            announce_first: config.reconnect_announce_attempts,
        }
    }

    /// Whether another retry may be scheduled
    #[inline]
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Consume one attempt and decide. Never counts past `max_attempts`.
    pub fn next(&self, attempts: &mut u32) -> ReconnectDecision {
        if !self.allows(*attempts) {
            return ReconnectDecision::Exhausted {
                attempts: *attempts,
            };
        }

        *attempts += 1;
        if *attempts >= self.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: *attempts,
            };
        }

        ReconnectDecision::Retry {
            attempt: *attempts,
            delay: self.delay_for(*attempts),
            announce: *attempts <= self.announce_first,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}
