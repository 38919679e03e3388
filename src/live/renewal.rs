//! Credential renewal scheduling

use std::time::Duration;

use crate::config::ManagerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// How far ahead of expiry to renew
    pub lead: Duration,
    /// Minimum delay, also used when the credential is already expired
    pub floor: Duration,
}

impl RenewalPolicy {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            lead: config.renewal_lead,
            floor: config.renewal_floor,
        }
    }

    /// `max(expires_at_ms - now - lead, floor)`
    pub fn delay(&self, expires_at_ms: i64, now_ms: i64) -> Duration {
        let lead_ms = self.lead.as_millis() as i64;
        let floor_ms = self.floor.as_millis() as i64;
        let due_in = expires_at_ms
            .saturating_sub(now_ms)
            .saturating_sub(lead_ms);
        Duration::from_millis(due_in.max(floor_ms) as u64)
    }
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}
