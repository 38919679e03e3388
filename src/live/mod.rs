//! Live daemon connections
//!
//! One [`LiveConnection`] per managed entity: credential fetch, socket session,
//! authentication handshake, credential renewal, reconnect with linear backoff
//! and metrics polling, all driven by a single actor per entity.

pub mod clock;
pub mod connection;
pub mod counters;
pub mod credential;
mod machine;
pub mod notice;
pub mod observer;
pub mod poller;
pub mod reconnect;
pub mod renewal;
pub mod session;
pub mod stats;
pub mod timer;
pub mod wire;

pub use clock::{Clock, SharedClock, SystemClock};
pub use connection::{
    ConnectOutcome, ConnectionStatus, ConnectionView, LiveConnection, LiveDeps, LiveSink,
    LiveUpdate, Liveness,
};
pub use counters::{ConnectionCounters, CountersSnapshot};
pub use credential::{Credential, CredentialError, CredentialFetcher, PanelCredentialFetcher};
pub use notice::{Notice, NoticeSink, Severity, SuspendFlag, TracingNoticeSink};
pub use observer::{AuthObserver, ObserverId};
pub use session::{SessionEvent, SessionEvents, SessionHandle, SessionId, Transport, WsTransport};
pub use stats::MetricsSample;
pub use timer::{ArmedTimers, TimerKind};
pub use wire::{InboundEvent, OutboundMessage, PowerAction};
