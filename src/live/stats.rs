//! Daemon resource statistics.
//!
//! The daemon answers `send stats` with a `stats` event whose first argument
//! is a JSON-encoded payload. [`RawStats`] mirrors that payload;
//! [`MetricsSample`] is the normalized form handed to dashboards.

use serde::{Deserialize, Serialize};

/// Raw stats payload as emitted by the daemon
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStats {
    #[serde(default)]
    pub cpu_absolute: f64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub memory_limit_bytes: u64,
    #[serde(default)]
    pub disk_bytes: u64,
    #[serde(default)]
    pub network: Option<RawNetwork>,
    // Older daemons flatten the network counters
    #[serde(default)]
    pub network_rx_bytes: Option<u64>,
    #[serde(default)]
    pub network_tx_bytes: Option<u64>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNetwork {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

impl RawStats {
    /// Parse the JSON-encoded payload carried in `args[0]`
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

/// Normalized metrics sample, built fresh for every stats event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSample {
    /// `cpu_absolute` rounded to whole percent (may exceed 100 on multi-core)
    pub cpu_percent: u32,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub disk_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub state: String,
    /// Milliseconds since the workload process started
    pub uptime: u64,
}

impl MetricsSample {
    pub fn from_raw(raw: RawStats) -> Self {
        let (rx, tx) = match &raw.network {
            Some(net) => (net.rx_bytes, net.tx_bytes),
            None => (
                raw.network_rx_bytes.unwrap_or(0),
                raw.network_tx_bytes.unwrap_or(0),
            ),
        };

        Self {
            cpu_percent: raw.cpu_absolute.max(0.0).round() as u32,
            memory_bytes: raw.memory_bytes,
            memory_limit_bytes: raw.memory_limit_bytes,
            disk_bytes: raw.disk_bytes,
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            state: raw.state,
            uptime: raw.uptime,
        }
    }

    pub fn parse(payload: &str) -> Option<Self> {
        RawStats::parse(payload).map(Self::from_raw)
    }

    /// Memory usage as a fraction of the limit, if the daemon reports one
    pub fn memory_ratio(&self) -> Option<f64> {
        if self.memory_limit_bytes == 0 {
            return None;
        }
        Some(self.memory_bytes as f64 / self.memory_limit_bytes as f64)
    }
}
