//! Operator-facing notices
//!
//! Everything a connection wants to tell a human goes through a [`NoticeSink`].
//! The [`SuspendFlag`] is checked before every notice and before any new retry
//! is scheduled, so a host that is shutting down (or navigating away) gets
//! silence instead of a burst of errors.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    CredentialFailed { reason: String },
    AuthenticationFailed,
    AuthenticationTimedOut,
    /// Renewal failed; a reload is requested right after
    SessionExpired,
    Reconnecting {
        attempt: u32,
        max: u32,
        delay: Duration,
    },
    ReconnectGaveUp { attempts: u32 },
    DaemonError { message: Option<String> },
}

impl Notice {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Reconnecting { .. } => Severity::Info,
            Self::DaemonError { .. } => Severity::Warning,
            Self::CredentialFailed { .. }
            | Self::AuthenticationFailed
            | Self::AuthenticationTimedOut
            | Self::SessionExpired
            | Self::ReconnectGaveUp { .. } => Severity::Error,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CredentialFailed { reason } => {
                write!(f, "could not obtain a daemon credential: {reason}")
            }
            Self::AuthenticationFailed => write!(f, "daemon rejected the credential"),
            Self::AuthenticationTimedOut => write!(f, "daemon did not confirm authentication"),
            Self::SessionExpired => write!(f, "session expired and could not be renewed"),
            Self::Reconnecting {
                attempt,
                max,
                delay,
            } => write!(
                f,
                "connection lost, retrying in {}s (attempt {attempt}/{max})",
                delay.as_secs()
            ),
            Self::ReconnectGaveUp { attempts } => {
                write!(f, "giving up after {attempts} reconnect attempts")
            }
            Self::DaemonError { message: Some(m) } => write!(f, "daemon error: {m}"),
            Self::DaemonError { message: None } => write!(f, "daemon error"),
        }
    }
}

pub trait NoticeSink: Send + Sync {
    fn notify(&self, entity_id: &str, notice: Notice);

    /// Last-resort recovery after a failed renewal: the host should rebuild
    /// its client state from scratch.
    fn request_reload(&self, entity_id: &str) {
        let _ = entity_id;
    }
}

/// Logs notices; the default sink
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNoticeSink;

impl NoticeSink for TracingNoticeSink {
    fn notify(&self, entity_id: &str, notice: Notice) {
        match notice.severity() {
            Severity::Info => info!(entity = %entity_id, notice = %notice, "notice"),
            Severity::Warning => warn!(entity = %entity_id, notice = %notice, "notice"),
            Severity::Error => error!(entity = %entity_id, notice = %notice, "notice"),
        }
    }

    fn request_reload(&self, entity_id: &str) {
        warn!(entity = %entity_id, "reload_requested");
    }
}

/// Caller-owned "going away" signal shared by every connection of a host
#[derive(Debug, Clone, Default)]
pub struct SuspendFlag(Arc<AtomicBool>);

impl SuspendFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// At most one permit per interval
#[derive(Debug, Clone)]
pub struct NoticeThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl NoticeThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn permit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
