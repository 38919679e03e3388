//! Consumer surface for one live connection
//!
//! [`LiveConnection`] is a cheap, cloneable handle onto a per-entity actor.
//! Commands go in through the actor mailbox; state comes back out through a
//! `watch` view (status, liveness, latency), a `broadcast` of decoded inbound
//! events, and optionally a [`LiveSink`] that mirrors daemon status and
//! metrics into a fleet-wide snapshot.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::clock::{system_clock, SharedClock};
use super::counters::ConnectionCounters;
use super::credential::{CredentialFetcher, PanelCredentialFetcher};
use super::machine::{Command, Input, Machine};
use super::notice::{NoticeSink, SuspendFlag, TracingNoticeSink};
use super::observer::{AuthObserver, AuthObservers, ObserverId};
use super::session::{Transport, WsTransport};
use super::stats::MetricsSample;
use super::timer::ArmedTimers;
use super::wire::{InboundEvent, OutboundMessage, PowerAction};
use crate::config::{ManagerConfig, PanelConfig};

// =============================================================================
// DEPENDENCIES
// =============================================================================

/// Collaborators shared by every connection of one host
#[derive(Clone)]
pub struct LiveDeps {
    pub config: ManagerConfig,
    pub fetcher: Arc<dyn CredentialFetcher>,
    pub transport: Arc<dyn Transport>,
    pub notices: Arc<dyn NoticeSink>,
    pub clock: SharedClock,
    pub suspend: SuspendFlag,
}

impl LiveDeps {
    pub fn new(fetcher: Arc<dyn CredentialFetcher>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: ManagerConfig::default(),
            fetcher,
            transport,
            notices: Arc::new(TracingNoticeSink),
            clock: system_clock(),
            suspend: SuspendFlag::new(),
        }
    }

    /// Real panel fetcher plus websocket transport
    pub fn from_panel(panel: &PanelConfig, config: ManagerConfig) -> anyhow::Result<Self> {
        let fetcher = PanelCredentialFetcher::new(panel)?;
        let transport = WsTransport::new(panel.origin.clone(), panel.connect_timeout);
        Ok(Self::new(Arc::new(fetcher), Arc::new(transport)).with_config(config))
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notices(mut self, notices: Arc<dyn NoticeSink>) -> Self {
        self.notices = notices;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_suspend_flag(mut self, suspend: SuspendFlag) -> Self {
        self.suspend = suspend;
        self
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Socket-level status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Whether the daemon is actually producing signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    #[default]
    Unknown,
    Healthy,
    Error,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Reactive view of one connection
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionView {
    pub status: ConnectionStatus,
    pub liveness: Liveness,
    /// Last metrics round trip
    pub latency: Option<Duration>,
    pub reconnect_attempts: u32,
    pub refreshing_credential: bool,
    /// Last status string reported by the daemon
    pub reported_status: Option<String>,
    pub timers: ArmedTimers,
    pub session_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    Failed(String),
    /// Disconnected (or suspended) before the attempt finished
    Cancelled,
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::AlreadyConnected)
    }
}

/// Daemon-reported state pushed to whoever aggregates the fleet
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUpdate {
    pub status: Option<String>,
    pub metrics: Option<MetricsSample>,
    /// Epoch ms
    pub at_ms: i64,
}

pub trait LiveSink: Send + Sync {
    fn publish(&self, entity_id: &str, update: LiveUpdate);
}

// =============================================================================
// HANDLE
// =============================================================================

#[derive(Clone)]
pub struct LiveConnection {
    inner: Arc<Inner>,
}

struct Inner {
    entity_id: String,
    mailbox: mpsc::UnboundedSender<Input>,
    view: watch::Receiver<ConnectionView>,
    events: broadcast::Sender<InboundEvent>,
    observers: Arc<RwLock<AuthObservers>>,
    counters: Arc<ConnectionCounters>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl LiveConnection {
    /// Spawn the actor for `entity_id`. Nothing connects until asked.
    pub fn spawn(entity_id: impl Into<String>, deps: LiveDeps) -> Self {
        Self::spawn_with_sink(entity_id, deps, None)
    }

    pub fn spawn_with_sink(
        entity_id: impl Into<String>,
        deps: LiveDeps,
        sink: Option<Arc<dyn LiveSink>>,
    ) -> Self {
        let entity_id = entity_id.into();
        let (mailbox, rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(ConnectionView::default());
        let (events, _) = broadcast::channel(deps.config.event_buffer.max(1));
        let observers = Arc::new(RwLock::new(AuthObservers::new()));
        let counters = Arc::new(ConnectionCounters::new());

        let machine = Machine::new(
            entity_id.clone(),
            deps,
            mailbox.clone(),
            view_tx,
            events.clone(),
            Arc::clone(&observers),
            Arc::clone(&counters),
            sink,
        );
        let task = tokio::spawn(machine.run(rx));

        Self {
            inner: Arc::new(Inner {
                entity_id,
                mailbox,
                view,
                events,
                observers,
                counters,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.inner.entity_id
    }

    fn command(&self, command: Command) -> bool {
        self.inner.mailbox.send(Input::Command(command)).is_ok()
    }

    /// Connect and wait for the handshake to finish (or fail).
    /// Joins an attempt already in flight.
    pub async fn connect(&self) -> ConnectOutcome {
        let (tx, rx) = oneshot::channel();
        if !self.command(Command::Connect { reply: Some(tx) }) {
            return ConnectOutcome::Cancelled;
        }
        rx.await.unwrap_or(ConnectOutcome::Cancelled)
    }

    /// Fire-and-forget connect
    pub fn start(&self) -> bool {
        self.command(Command::Connect { reply: None })
    }

    /// Tear down the session and every pending timer
    pub fn disconnect(&self) -> bool {
        self.command(Command::Disconnect)
    }

    /// Returns true if the frame was written to an authenticated session
    pub async fn send_message(&self, message: OutboundMessage) -> bool {
        let (tx, rx) = oneshot::channel();
        if !self.command(Command::Send { message, reply: tx }) {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Ask the daemon for one stats sample now
    pub async fn request_metrics(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if !self.command(Command::RequestMetrics { reply: tx }) {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn send_command(&self, command: &str) -> bool {
        self.send_message(OutboundMessage::command(command)).await
    }

    pub async fn send_power_action(&self, action: PowerAction) -> bool {
        self.send_message(OutboundMessage::power(action)).await
    }

    /// Ask the daemon to replay recent console output
    pub async fn request_logs(&self) -> bool {
        self.send_message(OutboundMessage::request_logs()).await
    }

    pub fn view(&self) -> ConnectionView {
        self.inner.view.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.view.borrow().status
    }

    pub fn liveness(&self) -> Liveness {
        self.inner.view.borrow().liveness
    }

    pub fn latency(&self) -> Option<Duration> {
        self.inner.view.borrow().latency
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Change-notifying view receiver
    pub fn watch(&self) -> watch::Receiver<ConnectionView> {
        self.inner.view.clone()
    }

    /// Every decoded inbound event, after the connection has acted on it
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_auth_observer(&self, observer: Arc<dyn AuthObserver>) -> ObserverId {
        self.inner.observers.write().add(observer)
    }

    pub fn remove_auth_observer(&self, id: ObserverId) -> bool {
        self.inner.observers.write().remove(id)
    }

    pub fn counters(&self) -> &ConnectionCounters {
        &self.inner.counters
    }

    /// Disconnect and stop the actor. The handle is inert afterwards.
    pub async fn shutdown(&self) {
        self.command(Command::Shutdown);
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConnection")
            .field("entity_id", &self.inner.entity_id)
            .field("view", &*self.inner.view.borrow())
            .finish()
    }
}
