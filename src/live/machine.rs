//! Per-entity connection state machine
//!
//! One actor task per entity. Every input (operator commands, credential
//! results, socket events, timer fires) arrives through a single mailbox, so
//! transitions are strictly serialized. The actor owns the session, the
//! credential and all four timers; nothing else can touch them.
//!
//! Transitions:
//! - `Disconnected -> Connecting` on connect (fetch credential, open, auth)
//! - `Connecting -> Connected` on `auth success`
//! - `Connecting -> Disconnected` on auth error / timeout / socket loss
//! - `Connected -> Connecting` on renewal (refresh guard set)
//! - `Connected -> Disconnected` on socket loss, then linear-backoff retry

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::connection::{
    ConnectOutcome, ConnectionStatus, ConnectionView, LiveDeps, LiveSink, LiveUpdate, Liveness,
};
use super::counters::ConnectionCounters;
use super::credential::{Credential, CredentialError};
use super::notice::{Notice, NoticeThrottle};
use super::observer::AuthObservers;
use super::poller::{polls_status, LatencyTracker};
use super::reconnect::{ReconnectDecision, ReconnectPolicy};
use super::renewal::RenewalPolicy;
use super::session::{SessionEvent, SessionEvents, SessionHandle, SessionId};
use super::stats::MetricsSample;
use super::timer::{ArmedTimers, TimerFired, TimerKind, TimerSlot};
use super::wire::{self, InboundEvent, OutboundMessage};

// =============================================================================
// MAILBOX
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchPurpose {
    Connect,
    Renew,
}

pub(crate) enum Command {
    Connect {
        reply: Option<oneshot::Sender<ConnectOutcome>>,
    },
    Disconnect,
    Send {
        message: OutboundMessage,
        reply: oneshot::Sender<bool>,
    },
    RequestMetrics {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

pub(crate) enum Input {
    Command(Command),
    CredentialResolved {
        epoch: u64,
        purpose: FetchPurpose,
        result: Result<Credential, CredentialError>,
    },
    Session {
        id: SessionId,
        event: SessionEvent,
    },
    Timer(TimerFired),
}

impl From<TimerFired> for Input {
    fn from(fired: TimerFired) -> Self {
        Input::Timer(fired)
    }
}

// =============================================================================
// MACHINE
// =============================================================================

pub(crate) struct Machine {
    entity_id: String,
    deps: LiveDeps,
    mailbox: mpsc::UnboundedSender<Input>,

    status: ConnectionStatus,
    liveness: Liveness,
    session: Option<SessionHandle>,
    next_session_id: SessionId,
    credential: Option<Credential>,
    reconnect_attempts: u32,
    refreshing: bool,
    /// Bumped per fetch; results carrying an older epoch are ignored
    fetch_epoch: u64,

    renewal_timer: TimerSlot,
    reconnect_timer: TimerSlot,
    metrics_timer: TimerSlot,
    auth_timer: TimerSlot,

    reported_status: Option<String>,
    latency: LatencyTracker,
    daemon_error_throttle: NoticeThrottle,
    renewal_policy: RenewalPolicy,
    reconnect_policy: ReconnectPolicy,

    waiters: Vec<oneshot::Sender<ConnectOutcome>>,
    observers: Arc<RwLock<AuthObservers>>,
    view: watch::Sender<ConnectionView>,
    events: broadcast::Sender<InboundEvent>,
    live_sink: Option<Arc<dyn LiveSink>>,
    counters: Arc<ConnectionCounters>,
}

impl Machine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        entity_id: String,
        deps: LiveDeps,
        mailbox: mpsc::UnboundedSender<Input>,
        view: watch::Sender<ConnectionView>,
        events: broadcast::Sender<InboundEvent>,
        observers: Arc<RwLock<AuthObservers>>,
        counters: Arc<ConnectionCounters>,
        live_sink: Option<Arc<dyn LiveSink>>,
    ) -> Self {
        let renewal_policy = RenewalPolicy::from_config(&deps.config);
        let reconnect_policy = ReconnectPolicy::from_config(&deps.config);
        let daemon_error_throttle = NoticeThrottle::new(deps.config.daemon_error_notice_interval);

        Self {
            entity_id,
            deps,
            mailbox,
            status: ConnectionStatus::Disconnected,
            liveness: Liveness::Unknown,
            session: None,
            next_session_id: 1,
            credential: None,
            reconnect_attempts: 0,
            refreshing: false,
            fetch_epoch: 0,
            renewal_timer: TimerSlot::new(TimerKind::Renewal),
            reconnect_timer: TimerSlot::new(TimerKind::Reconnect),
            metrics_timer: TimerSlot::new(TimerKind::MetricsPoll),
            auth_timer: TimerSlot::new(TimerKind::AuthTimeout),
            reported_status: None,
            latency: LatencyTracker::new(),
            daemon_error_throttle,
            renewal_policy,
            reconnect_policy,
            waiters: Vec::new(),
            observers,
            view,
            events,
            live_sink,
            counters,
        }
    }

    pub(crate) async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Input>) {
        debug!(entity = %self.entity_id, "connection_actor_started");

        while let Some(input) = mailbox.recv().await {
            match input {
                Input::Command(Command::Shutdown) => {
                    self.disconnect();
                    break;
                }
                Input::Command(command) => self.handle_command(command),
                Input::CredentialResolved {
                    epoch,
                    purpose,
                    result,
                } => self.on_credential(epoch, purpose, result),
                Input::Session { id, event } => self.on_session(id, event),
                Input::Timer(fired) => self.on_timer(fired),
            }
        }

        debug!(entity = %self.entity_id, "connection_actor_stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.handle_connect(reply),
            Command::Disconnect => self.disconnect(),
            Command::Send { message, reply } => {
                let _ = reply.send(self.send_authenticated(&message));
            }
            Command::RequestMetrics { reply } => {
                let _ = reply.send(self.request_metrics());
            }
            Command::Shutdown => self.disconnect(),
        }
    }

    #[inline]
    fn suspended(&self) -> bool {
        self.deps.suspend.is_suspended()
    }

    // =========================================================================
    // CONNECT
    // =========================================================================

    fn handle_connect(&mut self, reply: Option<oneshot::Sender<ConnectOutcome>>) {
        match self.status {
            ConnectionStatus::Connected => {
                if let Some(reply) = reply {
                    let _ = reply.send(ConnectOutcome::AlreadyConnected);
                }
            }
            ConnectionStatus::Connecting => {
                // Join the attempt in flight
                self.waiters.extend(reply);
            }
            ConnectionStatus::Disconnected => {
                self.waiters.extend(reply);
                self.begin_connect();
            }
        }
    }

    fn begin_connect(&mut self) {
        self.reconnect_timer.cancel();
        self.set_status(ConnectionStatus::Connecting, "connect");
        self.counters.record_connect_attempt();
        self.spawn_fetch(FetchPurpose::Connect);
        self.publish_view();
    }

    fn spawn_fetch(&mut self, purpose: FetchPurpose) {
        self.fetch_epoch = self.fetch_epoch.wrapping_add(1);
        let epoch = self.fetch_epoch;
        let fetcher = Arc::clone(&self.deps.fetcher);
        let entity_id = self.entity_id.clone();
        let tx = self.mailbox.clone();

        tokio::spawn(async move {
            let result = fetcher.fetch(&entity_id).await;
            let _ = tx.send(Input::CredentialResolved {
                epoch,
                purpose,
                result,
            });
        });
    }

    fn on_credential(
        &mut self,
        epoch: u64,
        purpose: FetchPurpose,
        result: Result<Credential, CredentialError>,
    ) {
        if epoch != self.fetch_epoch || self.status != ConnectionStatus::Connecting {
            debug!(entity = %self.entity_id, epoch, "stale_credential_ignored");
            return;
        }

        if self.suspended() {
            // Resolved after the host went away
            self.refreshing = false;
            self.set_status(ConnectionStatus::Disconnected, "suspended");
            self.resolve_waiters(ConnectOutcome::Cancelled);
            self.publish_view();
            return;
        }

        match result {
            Ok(credential) => {
                self.credential = Some(credential);
                self.open_session();
            }
            Err(e) => match purpose {
                FetchPurpose::Renew => self.fail_renewal(&e.to_string()),
                FetchPurpose::Connect => self.fail_credential(e),
            },
        }
    }

    fn open_session(&mut self) {
        let Some(target) = self
            .credential
            .as_ref()
            .map(|c| c.connection_string.clone())
        else {
            return;
        };

        if let Some(old) = self.session.take() {
            old.close();
        }

        let id = self.next_session_id;
        self.next_session_id += 1;
        let events = SessionEvents::new(id, self.mailbox.clone());
        let handle = self.deps.transport.open(&target, events);
        self.session = Some(handle);

        self.auth_timer.arm(self.deps.config.auth_timeout, &self.mailbox);
        debug!(entity = %self.entity_id, session = id, "session_opening");
        self.publish_view();
    }

    fn fail_credential(&mut self, error: CredentialError) {
        warn!(entity = %self.entity_id, error = %error, "credential_fetch_failed");
        self.counters.record_connect_failure();
        self.liveness = Liveness::Error;
        self.set_status(ConnectionStatus::Disconnected, "credential_failed");
        self.resolve_waiters(ConnectOutcome::Failed(error.to_string()));
        self.notify(Notice::CredentialFailed {
            reason: error.to_string(),
        });
        self.schedule_reconnect();
        self.publish_view();
    }

    // =========================================================================
    // SESSION EVENTS
    // =========================================================================

    fn on_session(&mut self, id: SessionId, event: SessionEvent) {
        if self.session.as_ref().map(|s| s.id()) != Some(id) {
            debug!(entity = %self.entity_id, session = id, "stale_session_event");
            return;
        }

        match event {
            SessionEvent::Opened => self.on_opened(),
            SessionEvent::Frame(text) => self.on_frame(&text),
            SessionEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "closed by peer".to_string());
                self.on_socket_lost(&reason);
            }
            SessionEvent::Failed(error) => self.on_socket_lost(&error),
        }
    }

    fn on_opened(&mut self) {
        let (Some(session), Some(credential)) = (self.session.as_ref(), self.credential.as_ref())
        else {
            return;
        };

        session.mark_open();
        // First frame on every session is the credential
        if !session.send(&OutboundMessage::auth(&credential.token)) {
            warn!(entity = %self.entity_id, "auth_send_failed");
        }
        self.publish_view();
    }

    fn on_frame(&mut self, text: &str) {
        let decoded = wire::decode(text);
        self.counters.record_frame(decoded.is_some());
        let Some(event) = decoded else {
            return;
        };

        trace!(entity = %self.entity_id, event = event.name(), "inbound_frame");
        self.dispatch(&event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn dispatch(&mut self, event: &InboundEvent) {
        match event {
            InboundEvent::AuthSuccess => self.on_auth_success(),
            InboundEvent::AuthError => self.on_auth_failure(false),
            InboundEvent::TokenExpiring => {
                if self.status == ConnectionStatus::Connected {
                    self.begin_renewal("token_expiring");
                }
            }
            InboundEvent::TokenExpired | InboundEvent::JwtError(_) => {
                if self.status == ConnectionStatus::Connected {
                    self.begin_renewal("token_expired");
                }
            }
            InboundEvent::DaemonError(message) => self.on_daemon_error(message.clone()),
            InboundEvent::Status(status) => self.on_status(status),
            InboundEvent::Stats(sample) => self.on_stats(sample),
            InboundEvent::ConsoleOutput(_)
            | InboundEvent::InstallOutput(_)
            | InboundEvent::InstallStarted
            | InboundEvent::InstallCompleted
            | InboundEvent::BackupCompleted
            | InboundEvent::TransferLogs(_)
            | InboundEvent::TransferStatus(_) => {}
            InboundEvent::Unknown { .. } => {
                debug!(entity = %self.entity_id, event = event.name(), "unknown_event");
            }
        }
    }

    // =========================================================================
    // AUTHENTICATION
    // =========================================================================

    fn on_auth_success(&mut self) {
        if self.status != ConnectionStatus::Connecting || self.session.is_none() {
            debug!(entity = %self.entity_id, status = %self.status, "unexpected_auth_success");
            return;
        }

        self.auth_timer.cancel();
        let renewal = std::mem::replace(&mut self.refreshing, false);
        self.reconnect_attempts = 0;
        self.liveness = Liveness::Healthy;
        self.set_status(ConnectionStatus::Connected, "authenticated");
        self.counters.record_connect_success();
        self.schedule_renewal();

        info!(entity = %self.entity_id, renewal, "authenticated");
        self.publish_view();
        self.resolve_waiters(ConnectOutcome::Connected);

        AuthObservers::notify(&self.observers, &self.entity_id, renewal);

        self.request_metrics();
        self.rearm_poller();
        self.publish_view();
    }

    fn on_auth_failure(&mut self, timed_out: bool) {
        if self.session.is_none() {
            return;
        }

        self.auth_timer.cancel();
        self.counters.record_auth_failure();

        let reason = if timed_out {
            "authentication timed out"
        } else {
            "authentication rejected"
        };

        if self.refreshing {
            self.fail_renewal(reason);
            return;
        }

        warn!(entity = %self.entity_id, timed_out, "authentication_failed");
        self.drop_session();
        self.renewal_timer.cancel();
        self.metrics_timer.cancel();
        self.reconnect_timer.cancel();
        self.latency.clear_pending();
        self.liveness = Liveness::Error;
        self.set_status(ConnectionStatus::Disconnected, "auth_failed");
        self.resolve_waiters(ConnectOutcome::Failed(reason.to_string()));
        // Not transient: no automatic reconnect
        self.notify(if timed_out {
            Notice::AuthenticationTimedOut
        } else {
            Notice::AuthenticationFailed
        });
        self.publish_view();
    }

    // =========================================================================
    // RENEWAL
    // =========================================================================

    fn schedule_renewal(&mut self) {
        let Some(expires_at_ms) = self.credential.as_ref().map(Credential::expires_at_ms) else {
            return;
        };
        let delay = self
            .renewal_policy
            .delay(expires_at_ms, self.deps.clock.now_ms());
        self.renewal_timer.arm(delay, &self.mailbox);
        debug!(
            entity = %self.entity_id,
            delay_ms = delay.as_millis() as u64,
            "renewal_scheduled"
        );
    }

    fn begin_renewal(&mut self, reason: &str) {
        if self.refreshing || self.suspended() || self.status != ConnectionStatus::Connected {
            return;
        }

        info!(entity = %self.entity_id, reason = %reason, "credential_renewal");
        self.refreshing = true;
        self.counters.record_renewal();
        self.renewal_timer.cancel();
        self.metrics_timer.cancel();
        self.latency.clear_pending();
        // Handle dropped before any close event can reach us
        if let Some(old) = self.session.take() {
            old.close();
        }
        self.set_status(ConnectionStatus::Connecting, "renewal");
        self.spawn_fetch(FetchPurpose::Renew);
        self.publish_view();
    }

    fn fail_renewal(&mut self, reason: &str) {
        warn!(entity = %self.entity_id, reason = %reason, "renewal_failed");
        self.counters.record_renewal_failure();
        self.refreshing = false;
        self.drop_session();
        self.auth_timer.cancel();
        self.renewal_timer.cancel();
        self.metrics_timer.cancel();
        self.latency.clear_pending();
        self.liveness = Liveness::Error;
        self.set_status(ConnectionStatus::Disconnected, "renewal_failed");
        self.resolve_waiters(ConnectOutcome::Failed(reason.to_string()));
        self.publish_view();

        if !self.suspended() {
            self.deps.notices.notify(&self.entity_id, Notice::SessionExpired);
            self.deps.notices.request_reload(&self.entity_id);
        }
    }

    // =========================================================================
    // CONNECTIVITY LOSS
    // =========================================================================

    fn on_socket_lost(&mut self, reason: &str) {
        self.session = None;
        self.auth_timer.cancel();
        self.metrics_timer.cancel();
        self.latency.clear_pending();

        if self.refreshing {
            self.fail_renewal(reason);
            return;
        }

        warn!(entity = %self.entity_id, reason = %reason, "session_lost");
        self.renewal_timer.cancel();
        self.counters.record_connect_failure();
        self.set_status(ConnectionStatus::Disconnected, "session_lost");
        self.resolve_waiters(ConnectOutcome::Failed(reason.to_string()));
        self.schedule_reconnect();
        self.publish_view();
    }

    fn schedule_reconnect(&mut self) {
        if self.refreshing || self.suspended() {
            return;
        }

        match self.reconnect_policy.next(&mut self.reconnect_attempts) {
            ReconnectDecision::Retry {
                attempt,
                delay,
                announce,
            } => {
                self.reconnect_timer.arm(delay, &self.mailbox);
                self.counters.record_reconnect_scheduled();
                info!(
                    entity = %self.entity_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect_scheduled"
                );
                if announce {
                    self.notify(Notice::Reconnecting {
                        attempt,
                        max: self.reconnect_policy.max_attempts,
                        delay,
                    });
                }
            }
            ReconnectDecision::GiveUp { attempts } => {
                warn!(entity = %self.entity_id, attempts, "reconnect_gave_up");
                self.notify(Notice::ReconnectGaveUp { attempts });
            }
            ReconnectDecision::Exhausted { attempts } => {
                debug!(entity = %self.entity_id, attempts, "reconnect_exhausted");
            }
        }
        self.publish_view();
    }

    // =========================================================================
    // DAEMON SIGNAL
    // =========================================================================

    fn on_daemon_error(&mut self, message: Option<String>) {
        self.liveness = Liveness::Error;
        debug!(entity = %self.entity_id, message = ?message, "daemon_error");
        if self.daemon_error_throttle.permit(Instant::now()) {
            self.notify(Notice::DaemonError { message });
        }
        self.publish_view();
    }

    fn on_status(&mut self, status: &str) {
        self.liveness = Liveness::Healthy;
        self.reported_status = Some(status.to_string());
        self.publish_live(Some(status.to_string()), None);
        self.rearm_poller();
        if status == "running" {
            self.request_metrics();
        }
        self.publish_view();
    }

    fn on_stats(&mut self, sample: &MetricsSample) {
        self.liveness = Liveness::Healthy;
        if let Some(rtt) = self.latency.record_response() {
            debug!(entity = %self.entity_id, rtt_ms = rtt.as_millis() as u64, "metrics_rtt");
        }

        let state = (!sample.state.is_empty()).then(|| sample.state.clone());
        if state.is_some() && state != self.reported_status {
            self.reported_status = state.clone();
            self.rearm_poller();
        }
        self.publish_live(state, Some(sample.clone()));
        self.publish_view();
    }

    // =========================================================================
    // METRICS
    // =========================================================================

    fn rearm_poller(&mut self) {
        self.metrics_timer.cancel();
        let active = self.status == ConnectionStatus::Connected
            && self.reported_status.as_deref().map_or(false, polls_status);
        if active {
            self.metrics_timer
                .arm_repeating(self.deps.config.metrics_interval, &self.mailbox);
        }
    }

    fn request_metrics(&mut self) -> bool {
        let sent = self.send_authenticated(&OutboundMessage::request_stats());
        if sent {
            self.latency.record_request();
        }
        sent
    }

    fn send_authenticated(&self, message: &OutboundMessage) -> bool {
        if self.status != ConnectionStatus::Connected {
            return false;
        }
        self.session.as_ref().map_or(false, |s| s.send(message))
    }

    // =========================================================================
    // TIMERS
    // =========================================================================

    fn on_timer(&mut self, fired: TimerFired) {
        let slot = match fired.kind {
            TimerKind::Renewal => &mut self.renewal_timer,
            TimerKind::Reconnect => &mut self.reconnect_timer,
            TimerKind::MetricsPoll => &mut self.metrics_timer,
            TimerKind::AuthTimeout => &mut self.auth_timer,
        };
        if !slot.accept(fired.generation) {
            return;
        }

        match fired.kind {
            TimerKind::Renewal => {
                if self.status == ConnectionStatus::Connected {
                    self.begin_renewal("scheduled");
                }
            }
            TimerKind::Reconnect => {
                if !self.suspended() && self.status == ConnectionStatus::Disconnected {
                    info!(entity = %self.entity_id, attempt = self.reconnect_attempts, "reconnecting");
                    self.begin_connect();
                }
            }
            TimerKind::MetricsPoll => {
                if self.status == ConnectionStatus::Connected {
                    self.request_metrics();
                } else {
                    self.metrics_timer.cancel();
                }
            }
            TimerKind::AuthTimeout => {
                if self.status == ConnectionStatus::Connecting {
                    self.on_auth_failure(true);
                }
            }
        }
        self.publish_view();
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    fn disconnect(&mut self) {
        // Late credential results are now stale
        self.fetch_epoch = self.fetch_epoch.wrapping_add(1);
        self.renewal_timer.cancel();
        self.reconnect_timer.cancel();
        self.metrics_timer.cancel();
        self.auth_timer.cancel();
        if let Some(session) = self.session.take() {
            session.close();
        }

        self.credential = None;
        self.reconnect_attempts = 0;
        self.refreshing = false;
        self.liveness = Liveness::Unknown;
        self.latency.reset();
        self.daemon_error_throttle.reset();
        if self.status != ConnectionStatus::Disconnected {
            info!(entity = %self.entity_id, summary = %self.counters.summary(), "disconnected");
        }
        self.set_status(ConnectionStatus::Disconnected, "disconnect");
        self.resolve_waiters(ConnectOutcome::Cancelled);
        self.publish_view();
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    fn set_status(&mut self, status: ConnectionStatus, reason: &str) {
        if self.status == status {
            return;
        }
        debug!(
            entity = %self.entity_id,
            from = %self.status,
            to = %status,
            reason = %reason,
            "session_transition"
        );
        self.status = status;
    }

    fn resolve_waiters(&mut self, outcome: ConnectOutcome) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Suspension silences every notice
    fn notify(&self, notice: Notice) {
        if self.suspended() {
            return;
        }
        self.deps.notices.notify(&self.entity_id, notice);
    }

    fn publish_live(&self, status: Option<String>, metrics: Option<MetricsSample>) {
        if let Some(sink) = &self.live_sink {
            sink.publish(
                &self.entity_id,
                LiveUpdate {
                    status,
                    metrics,
                    at_ms: self.deps.clock.now_ms(),
                },
            );
        }
    }

    fn snapshot_view(&self) -> ConnectionView {
        ConnectionView {
            status: self.status,
            liveness: self.liveness,
            latency: self.latency.last(),
            reconnect_attempts: self.reconnect_attempts,
            refreshing_credential: self.refreshing,
            reported_status: self.reported_status.clone(),
            timers: ArmedTimers {
                renewal: self.renewal_timer.is_armed(),
                reconnect: self.reconnect_timer.is_armed(),
                metrics_poll: self.metrics_timer.is_armed(),
                auth_timeout: self.auth_timer.is_armed(),
            },
            session_open: self.session.as_ref().map_or(false, |s| s.is_open()),
        }
    }

    fn publish_view(&self) {
        let next = self.snapshot_view();
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
