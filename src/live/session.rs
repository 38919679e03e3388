//! Socket sessions
//!
//! A session is one websocket to a daemon. The connection actor never touches
//! the socket directly: it holds a [`SessionHandle`] for writes and receives
//! everything the socket does as [`SessionEvent`]s tagged with the session id,
//! so events from a replaced socket can be recognised and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::machine::Input;
use super::wire::OutboundMessage;

pub type SessionId = u64;

/// Something that happened on a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    Frame(String),
    /// Peer closed (or the stream ended); carries the close reason if any
    Closed(Option<String>),
    /// Connect or read failure
    Failed(String),
}

/// Event emitter handed to a transport when a session is opened
#[derive(Clone)]
pub struct SessionEvents {
    id: SessionId,
    tx: mpsc::UnboundedSender<Input>,
}

impl SessionEvents {
    pub(crate) fn new(id: SessionId, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns false once the owning connection is gone
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(Input::Session { id: self.id, event })
            .is_ok()
    }
}

/// Opens sessions to a daemon address
pub trait Transport: Send + Sync {
    fn open(&self, target: &str, events: SessionEvents) -> SessionHandle;
}

/// Write side of a session
///
/// Dropping the handle tears the socket down without emitting further events.
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<String>,
    task: Option<JoinHandle<()>>,
    opened: Arc<AtomicBool>,
}

impl SessionHandle {
    /// `task` is the socket driver, if the transport spawned one
    pub fn new(
        id: SessionId,
        outbound: mpsc::UnboundedSender<String>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            outbound,
            task,
            opened: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub(crate) fn mark_open(&self) {
        self.opened.store(true, Ordering::Release);
    }

    /// Queue a frame; refused until the socket has opened
    pub fn send(&self, message: &OutboundMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        match message.encode() {
            Ok(text) => self.outbound.send(text).is_ok(),
            Err(e) => {
                warn!(session = self.id, error = %e, "frame_encode_failed");
                false
            }
        }
    }

    /// Graceful close: the driver gets to send a close frame before exiting
    pub fn close(mut self) {
        self.opened.store(false, Ordering::Release);
        // Detach rather than abort
        self.task.take();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// WEBSOCKET TRANSPORT
// =============================================================================

/// tokio-tungstenite backed transport
#[derive(Debug, Clone)]
pub struct WsTransport {
    origin: Option<String>,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(origin: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            origin,
            connect_timeout,
        }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(None, Duration::from_secs(10))
    }
}

impl Transport for WsTransport {
    fn open(&self, target: &str, events: SessionEvents) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let id = events.id();
        let task = tokio::spawn(run_socket(
            target.to_string(),
            self.origin.clone(),
            self.connect_timeout,
            events,
            outbound_rx,
        ));
        SessionHandle::new(id, outbound_tx, Some(task))
    }
}

async fn run_socket(
    target: String,
    origin: Option<String>,
    connect_timeout: Duration,
    events: SessionEvents,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let mut request = match target.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            events.emit(SessionEvent::Failed(format!("invalid daemon address: {e}")));
            return;
        }
    };

    // Daemons validate Origin against the panel URL
    if let Some(origin) = origin {
        if let Ok(hv) = origin.parse() {
            request.headers_mut().insert("Origin", hv);
        }
    }

    let ws_stream = match tokio::time::timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok((stream, resp))) => {
            debug!(session = events.id(), status = %resp.status(), "daemon_socket_open");
            stream
        }
        Ok(Err(e)) => {
            events.emit(SessionEvent::Failed(e.to_string()));
            return;
        }
        Err(_) => {
            events.emit(SessionEvent::Failed("connect timed out".to_string()));
            return;
        }
    };

    if !events.emit(SessionEvent::Opened) {
        return;
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            out = outbound.recv() => {
                let Some(text) = out else {
                    // Handle closed by the owner; no further events
                    let _ = write.send(Message::Close(None)).await;
                    return;
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    events.emit(SessionEvent::Failed(e.to_string()));
                    return;
                }
            }
            ws_msg = read.next() => {
                let Some(ws_msg) = ws_msg else {
                    events.emit(SessionEvent::Closed(None));
                    return;
                };

                match ws_msg {
                    Ok(Message::Text(text)) => {
                        if !events.emit(SessionEvent::Frame(text)) {
                            return;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        events.emit(SessionEvent::Closed(reason));
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        events.emit(SessionEvent::Failed(e.to_string()));
                        return;
                    }
                }
            }
        }
    }
}
