//! Daemon socket wire format
//!
//! Every frame is a JSON text message shaped `{"event": "...", "args": [...]}`.
//! Inbound frames are decoded exactly once, at the session boundary, into
//! [`InboundEvent`]; the state machine only ever matches on the enum.
//! Frames that are not valid JSON (or carry an unparseable stats payload)
//! decode to `None` and are dropped without further ceremony.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::stats::MetricsSample;

// Outbound event names
pub const EVENT_AUTH: &str = "auth";
pub const EVENT_SEND_STATS: &str = "send stats";
pub const EVENT_SEND_COMMAND: &str = "send command";
pub const EVENT_SET_STATE: &str = "set state";
pub const EVENT_SEND_LOGS: &str = "send logs";

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub event: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl OutboundMessage {
    pub fn new(event: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    pub fn auth(token: &str) -> Self {
        Self::new(EVENT_AUTH, vec![token.to_string()])
    }

    pub fn request_stats() -> Self {
        Self::new(EVENT_SEND_STATS, Vec::new())
    }

    pub fn command(command: &str) -> Self {
        Self::new(EVENT_SEND_COMMAND, vec![command.to_string()])
    }

    pub fn power(action: PowerAction) -> Self {
        Self::new(EVENT_SET_STATE, vec![action.as_str().to_string()])
    }

    pub fn request_logs() -> Self {
        Self::new(EVENT_SEND_LOGS, Vec::new())
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Power signal accepted by `set state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "kill" => Ok(Self::Kill),
            other => Err(format!("unknown power action: {other}")),
        }
    }
}

/// Decoded inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    AuthSuccess,
    AuthError,
    /// Daemon warns that the current token is about to lapse
    TokenExpiring,
    TokenExpired,
    JwtError(Option<String>),
    DaemonError(Option<String>),
    Status(String),
    Stats(MetricsSample),
    ConsoleOutput(String),
    InstallOutput(String),
    InstallStarted,
    InstallCompleted,
    BackupCompleted,
    TransferLogs(String),
    TransferStatus(String),
    Unknown { event: String },
}

impl InboundEvent {
    /// Wire name, for logging
    pub fn name(&self) -> &str {
        match self {
            Self::AuthSuccess => "auth success",
            Self::AuthError => "auth_error",
            Self::TokenExpiring => "token expiring",
            Self::TokenExpired => "token expired",
            Self::JwtError(_) => "jwt error",
            Self::DaemonError(_) => "daemon error",
            Self::Status(_) => "status",
            Self::Stats(_) => "stats",
            Self::ConsoleOutput(_) => "console output",
            Self::InstallOutput(_) => "install output",
            Self::InstallStarted => "install started",
            Self::InstallCompleted => "install completed",
            Self::BackupCompleted => "backup completed",
            Self::TransferLogs(_) => "transfer logs",
            Self::TransferStatus(_) => "transfer status",
            Self::Unknown { event } => event,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl RawFrame {
    fn arg(&self, idx: usize) -> Option<String> {
        match self.args.get(idx)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn arg_or_empty(&self, idx: usize) -> String {
        self.arg(idx).unwrap_or_default()
    }
}

/// Decode one inbound text frame
pub fn decode(text: &str) -> Option<InboundEvent> {
    let frame: RawFrame = serde_json::from_str(text).ok()?;

    let event = match frame.event.as_str() {
        "auth success" => InboundEvent::AuthSuccess,
        "auth_error" | "auth error" => InboundEvent::AuthError,
        "token expiring" => InboundEvent::TokenExpiring,
        "token expired" => InboundEvent::TokenExpired,
        "jwt error" => InboundEvent::JwtError(frame.arg(0)),
        "daemon error" => InboundEvent::DaemonError(frame.arg(0)),
        "status" => InboundEvent::Status(frame.arg(0).unwrap_or_else(|| "offline".to_string())),
        "stats" => {
            // args[0] is usually a JSON string; some daemons inline the object
            let sample = match frame.args.first()? {
                Value::String(payload) => MetricsSample::parse(payload)?,
                obj @ Value::Object(_) => MetricsSample::parse(&obj.to_string())?,
                _ => return None,
            };
            InboundEvent::Stats(sample)
        }
        "console output" => InboundEvent::ConsoleOutput(frame.arg_or_empty(0)),
        "install output" => InboundEvent::InstallOutput(frame.arg_or_empty(0)),
        "install started" => InboundEvent::InstallStarted,
        "install completed" => InboundEvent::InstallCompleted,
        "backup completed" | "backup complete" => InboundEvent::BackupCompleted,
        "transfer logs" => InboundEvent::TransferLogs(frame.arg_or_empty(0)),
        "transfer status" => InboundEvent::TransferStatus(frame.arg_or_empty(0)),
        _ => InboundEvent::Unknown { event: frame.event },
    };

    Some(event)
}
