//! Metrics polling helpers

use std::time::Duration;

use tokio::time::Instant;

/// Only running or starting workloads are polled
#[inline]
pub fn polls_status(status: &str) -> bool {
    matches!(status, "running" | "starting")
}

/// Round-trip time between `send stats` and the next `stats` event
#[derive(Debug, Default, Clone)]
pub struct LatencyTracker {
    pending: Option<Instant>,
    last: Option<Duration>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the newest outstanding request is tracked
    pub fn record_request(&mut self) {
        self.pending = Some(Instant::now());
    }

    /// Stats arrived; returns the measured round trip if one was pending
    pub fn record_response(&mut self) -> Option<Duration> {
        let started = self.pending.take()?;
        let rtt = started.elapsed();
        self.last = Some(rtt);
        Some(rtt)
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.last = None;
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }
}
