//! Shared harness for the connection and registry tests
//!
//! `FakeBackend` issues credentials (or refuses to), `FakeDaemon` plays the
//! daemon side of every socket, and `RecordingNotices` captures what an
//! operator would have seen. All timing runs on tokio's paused clock.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use fleet_live::live::{
    Clock, Credential, CredentialError, CredentialFetcher, LiveConnection, LiveDeps, Notice,
    NoticeSink, SessionEvent, SessionEvents, SessionHandle, SessionId, SuspendFlag, Transport,
};
use fleet_live::{FleetRegistry, ManagerConfig};

pub const ANCHOR_MS: i64 = 1_700_000_000_000;

/// Let every ready task run; advances the paused clock by 1ms
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// =============================================================================
// CLOCK
// =============================================================================

/// Wall clock that follows tokio's (paused) time
pub struct PausedClock {
    anchor_ms: i64,
    start: tokio::time::Instant,
}

impl PausedClock {
    pub fn new() -> Self {
        Self {
            anchor_ms: ANCHOR_MS,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now_ms(&self) -> i64 {
        self.anchor_ms + self.start.elapsed().as_millis() as i64
    }
}

// =============================================================================
// CREDENTIAL BACKEND
// =============================================================================

pub struct FakeBackend {
    clock: Arc<PausedClock>,
    calls: AtomicUsize,
    calls_by_entity: Mutex<HashMap<String, usize>>,
    expires_in_secs: AtomicI64,
    fail_next: AtomicUsize,
    failing: AtomicBool,
    failing_entities: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeBackend {
    pub fn new(clock: Arc<PausedClock>) -> Self {
        Self {
            clock,
            calls: AtomicUsize::new(0),
            calls_by_entity: Mutex::new(HashMap::new()),
            expires_in_secs: AtomicI64::new(600),
            fail_next: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            failing_entities: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, entity_id: &str) -> usize {
        self.calls_by_entity
            .lock()
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }

    /// Negative values issue already-expired credentials
    pub fn set_expires_in(&self, secs: i64) {
        self.expires_in_secs.store(secs, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_entity(&self, entity_id: &str) {
        self.failing_entities.lock().insert(entity_id.to_string());
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    fn should_fail(&self, entity_id: &str) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        if self.failing_entities.lock().contains(entity_id) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CredentialFetcher for FakeBackend {
    async fn fetch(&self, entity_id: &str) -> Result<Credential, CredentialError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .calls_by_entity
            .lock()
            .entry(entity_id.to_string())
            .or_insert(0) += 1;

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail(entity_id) {
            return Err(CredentialError::Status(500, "backend unavailable".to_string()));
        }

        Ok(Credential {
            token: format!("tok-{entity_id}-{n}"),
            expires_at: self.clock.now_ms() / 1000 + self.expires_in_secs.load(Ordering::SeqCst),
            connection_string: format!("wss://node.test/api/servers/{entity_id}/ws"),
            permissions: vec!["*".to_string()],
        })
    }
}

// =============================================================================
// DAEMON
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonMode {
    /// Opens and answers `auth` with `auth success`
    Accept,
    /// Opens and answers `auth` with `auth_error`
    RejectAuth,
    /// Opens and never answers
    Silent,
    /// Connection refused
    Refuse,
}

pub struct FakeSession {
    pub id: SessionId,
    pub entity_id: String,
    events: SessionEvents,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn push(&self, frame: &str) -> bool {
        self.events.emit(SessionEvent::Frame(frame.to_string()))
    }

    pub fn push_event(&self, event: &str, args: &[&str]) -> bool {
        let frame = serde_json::json!({ "event": event, "args": args });
        self.push(&frame.to_string())
    }

    pub fn push_stats(&self, payload: serde_json::Value) -> bool {
        let frame = serde_json::json!({ "event": "stats", "args": [payload.to_string()] });
        self.push(&frame.to_string())
    }

    pub fn server_close(&self) -> bool {
        self.events.emit(SessionEvent::Closed(None))
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.events.emit(SessionEvent::Failed(reason.to_string()))
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter_map(|v| v["event"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count_sent(&self, event: &str) -> usize {
        self.sent_events().iter().filter(|e| *e == event).count()
    }

    /// The client dropped or closed its end
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeDaemon {
    mode: Mutex<DaemonMode>,
    entity_modes: Mutex<HashMap<String, DaemonMode>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(DaemonMode::Accept),
            entity_modes: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: DaemonMode) {
        *self.mode.lock() = mode;
    }

    pub fn set_entity_mode(&self, entity_id: &str, mode: DaemonMode) {
        self.entity_modes.lock().insert(entity_id.to_string(), mode);
    }

    fn mode_for(&self, entity_id: &str) -> DaemonMode {
        self.entity_modes
            .lock()
            .get(entity_id)
            .copied()
            .unwrap_or(*self.mode.lock())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().iter().filter(|s| !s.is_closed()).count()
    }

    pub fn session(&self, idx: usize) -> Arc<FakeSession> {
        Arc::clone(&self.sessions.lock()[idx])
    }

    pub fn latest(&self) -> Arc<FakeSession> {
        let sessions = self.sessions.lock();
        Arc::clone(sessions.last().expect("no session opened"))
    }

    pub fn latest_for(&self, entity_id: &str) -> Arc<FakeSession> {
        let sessions = self.sessions.lock();
        let session = sessions
            .iter()
            .rev()
            .find(|s| s.entity_id == entity_id)
            .expect("no session for entity");
        Arc::clone(session)
    }
}

fn entity_from_target(target: &str) -> String {
    // wss://node.test/api/servers/{id}/ws
    target
        .trim_end_matches("/ws")
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

impl Transport for FakeDaemon {
    fn open(&self, target: &str, events: SessionEvents) -> SessionHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let entity_id = entity_from_target(target);
        let mode = self.mode_for(&entity_id);

        let session = Arc::new(FakeSession {
            id: events.id(),
            entity_id,
            events: events.clone(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.sessions.lock().push(Arc::clone(&session));

        if mode == DaemonMode::Refuse {
            session.closed.store(true, Ordering::SeqCst);
            events.emit(SessionEvent::Failed("connection refused".to_string()));
            return SessionHandle::new(events.id(), tx, None);
        }

        events.emit(SessionEvent::Opened);

        let peer = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let is_auth = text.starts_with(r#"{"event":"auth""#);
                peer.sent.lock().push(text);
                if is_auth {
                    match mode {
                        DaemonMode::Accept => {
                            peer.push_event("auth success", &[]);
                        }
                        DaemonMode::RejectAuth => {
                            peer.push_event("auth_error", &[]);
                        }
                        DaemonMode::Silent | DaemonMode::Refuse => {}
                    }
                }
            }
            peer.closed.store(true, Ordering::SeqCst);
        });

        // No driver task: dropping the handle just closes the channel
        SessionHandle::new(events.id(), tx, None)
    }
}

// =============================================================================
// NOTICES
// =============================================================================

#[derive(Default)]
pub struct RecordingNotices {
    notices: Mutex<Vec<(String, Notice)>>,
    reloads: Mutex<Vec<String>>,
}

impl RecordingNotices {
    pub fn all(&self) -> Vec<Notice> {
        self.notices.lock().iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn for_entity(&self, entity_id: &str) -> Vec<Notice> {
        self.notices
            .lock()
            .iter()
            .filter(|(id, _)| id == entity_id)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Notice) -> bool) -> usize {
        self.notices.lock().iter().filter(|(_, n)| pred(n)).count()
    }

    pub fn reloads(&self) -> Vec<String> {
        self.reloads.lock().clone()
    }
}

impl NoticeSink for RecordingNotices {
    fn notify(&self, entity_id: &str, notice: Notice) {
        self.notices.lock().push((entity_id.to_string(), notice));
    }

    fn request_reload(&self, entity_id: &str) {
        self.reloads.lock().push(entity_id.to_string());
    }
}

// =============================================================================
// HARNESS
// =============================================================================

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub daemon: Arc<FakeDaemon>,
    pub notices: Arc<RecordingNotices>,
    pub suspend: SuspendFlag,
    pub deps: LiveDeps,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let clock = Arc::new(PausedClock::new());
        let backend = Arc::new(FakeBackend::new(Arc::clone(&clock)));
        let daemon = Arc::new(FakeDaemon::new());
        let notices = Arc::new(RecordingNotices::default());
        let suspend = SuspendFlag::new();

        let deps = LiveDeps::new(backend.clone(), daemon.clone())
            .with_config(config)
            .with_notices(notices.clone())
            .with_clock(clock)
            .with_suspend_flag(suspend.clone());

        Self {
            backend,
            daemon,
            notices,
            suspend,
            deps,
        }
    }

    pub fn connection(&self, entity_id: &str) -> LiveConnection {
        LiveConnection::spawn(entity_id, self.deps.clone())
    }

    pub fn registry(&self) -> FleetRegistry {
        FleetRegistry::init(self.deps.clone())
    }
}
