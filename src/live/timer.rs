//! Cancellable timers that deliver into the connection mailbox
//!
//! Each slot owns at most one pending task. Re-arming or cancelling bumps the
//! slot generation, so a fire that was already queued in the mailbox when the
//! slot changed is recognised as stale and ignored.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimerKind {
    Renewal,
    Reconnect,
    MetricsPoll,
    AuthTimeout,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Renewal => write!(f, "renewal"),
            Self::Reconnect => write!(f, "reconnect"),
            Self::MetricsPoll => write!(f, "metrics_poll"),
            Self::AuthTimeout => write!(f, "auth_timeout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

pub struct TimerSlot {
    kind: TimerKind,
    generation: u64,
    task: Option<JoinHandle<()>>,
    repeating: bool,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            generation: 0,
            task: None,
            repeating: false,
        }
    }

    /// One-shot; replaces whatever was pending
    pub fn arm<M>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<M>)
    where
        M: From<TimerFired> + Send + 'static,
    {
        self.cancel();
        let fired = TimerFired {
            kind: self.kind,
            generation: self.generation,
        };
        let tx = tx.clone();
        self.repeating = false;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(M::from(fired));
        }));
    }

    /// Fires every `period`, first fire one period from now
    pub fn arm_repeating<M>(&mut self, period: Duration, tx: &mpsc::UnboundedSender<M>)
    where
        M: From<TimerFired> + Send + 'static,
    {
        self.cancel();
        let fired = TimerFired {
            kind: self.kind,
            generation: self.generation,
        };
        let tx = tx.clone();
        self.repeating = true;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.send(M::from(fired)).is_err() {
                    return;
                }
            }
        }));
    }

    /// Returns true if something was pending
    pub fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        self.repeating = false;
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Validate a fire against the current generation. A one-shot disarms on
    /// acceptance.
    pub fn accept(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.task.is_none() {
            return false;
        }
        if !self.repeating {
            self.task = None;
            self.generation = self.generation.wrapping_add(1);
        }
        true
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Which timers are pending, as exposed in the connection view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArmedTimers {
    pub renewal: bool,
    pub reconnect: bool,
    pub metrics_poll: bool,
    pub auth_timeout: bool,
}

impl ArmedTimers {
    pub fn none(&self) -> bool {
        !(self.renewal || self.reconnect || self.metrics_poll || self.auth_timeout)
    }
}
