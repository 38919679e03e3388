use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-connection counters for monitoring
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub connect_attempts: AtomicU64,
    pub connect_successes: AtomicU64,
    pub connect_failures: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
    pub renewals: AtomicU64,
    pub renewal_failures: AtomicU64,
    pub auth_failures: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_ignored: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub connect_failures: u64,
    pub reconnects_scheduled: u64,
    pub renewals: u64,
    pub renewal_failures: u64,
    pub auth_failures: u64,
    pub frames_received: u64,
    pub frames_ignored: u64,
}

impl ConnectionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_success(&self) {
        self.connect_successes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_renewal(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_renewal_failure(&self) {
        self.renewal_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame(&self, decoded: bool) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        if !decoded {
            self.frames_ignored.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_successes: self.connect_successes.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
        }
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "connects={}/{} failures={} reconnects={} renewals={}/{} auth_failures={} frames={} ignored={}",
            s.connect_successes,
            s.connect_attempts,
            s.connect_failures,
            s.reconnects_scheduled,
            s.renewals - s.renewal_failures.min(s.renewals),
            s.renewals,
            s.auth_failures,
            s.frames_received,
            s.frames_ignored,
        )
    }
}
