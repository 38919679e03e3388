//! Runtime configuration
//!
//! Defaults match the panel's stock behaviour; every knob can be overridden
//! from the environment (`.env` is honoured).

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};

/// Per-connection timing and retry policy
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    // Reconnect
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    /// Only the first N retries are announced to the operator
    pub reconnect_announce_attempts: u32,

    // Handshake
    pub auth_timeout: Duration,

    // Credential renewal
    pub renewal_lead: Duration,
    pub renewal_floor: Duration,

    // Metrics polling
    pub metrics_interval: Duration,

    // Notices
    pub daemon_error_notice_interval: Duration,

    /// Capacity of the per-connection inbound event broadcast
    pub event_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            // Linear backoff: 5s, 10s, 15s, 20s then give up
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_announce_attempts: 2,

            auth_timeout: Duration::from_secs(15),

            // Refresh one minute ahead of expiry, never sooner than 5s out
            renewal_lead: Duration::from_secs(60),
            renewal_floor: Duration::from_secs(5),

            metrics_interval: Duration::from_secs(5),

            daemon_error_notice_interval: Duration::from_secs(30),

            event_buffer: 256,
        }
    }
}

impl ManagerConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u32>("LIVE_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = env_millis("LIVE_RECONNECT_BASE_MS") {
            config.reconnect_base_delay = v;
        }
        if let Some(v) = env_parse::<u32>("LIVE_RECONNECT_ANNOUNCE_ATTEMPTS") {
            config.reconnect_announce_attempts = v;
        }
        if let Some(v) = env_millis("LIVE_AUTH_TIMEOUT_MS") {
            config.auth_timeout = v;
        }
        if let Some(v) = env_millis("LIVE_RENEWAL_LEAD_MS") {
            config.renewal_lead = v;
        }
        if let Some(v) = env_millis("LIVE_RENEWAL_FLOOR_MS") {
            config.renewal_floor = v;
        }
        if let Some(v) = env_millis("LIVE_METRICS_INTERVAL_MS") {
            config.metrics_interval = v;
        }
        if let Some(v) = env_millis("LIVE_DAEMON_ERROR_NOTICE_MS") {
            config.daemon_error_notice_interval = v;
        }
        if let Some(v) = env_parse::<usize>("LIVE_EVENT_BUFFER").filter(|&v| v > 0) {
            config.event_buffer = v;
        }

        config
    }
}

/// Panel backend that issues daemon credentials
#[derive(Clone)]
pub struct PanelConfig {
    /// e.g. `https://panel.example.com`
    pub base_url: String,
    pub api_key: Option<String>,
    pub session_cookie: Option<String>,
    /// `Origin` header presented to daemons (they check it against the panel URL)
    pub origin: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl PanelConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            session_cookie: None,
            origin: None,
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let base_url = std::env::var("PANEL_URL").context("PANEL_URL is not set")?;
        let mut config = Self::new(base_url);

        config.api_key = std::env::var("PANEL_API_KEY").ok().filter(|v| !v.is_empty());
        config.session_cookie = std::env::var("PANEL_SESSION_COOKIE")
            .ok()
            .filter(|v| !v.is_empty());
        config.origin = std::env::var("PANEL_ORIGIN")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| Some(config.base_url.clone()));

        if let Some(v) = env_millis("PANEL_REQUEST_TIMEOUT_MS") {
            config.request_timeout = v;
        }
        if let Some(v) = env_millis("PANEL_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = v;
        }

        Ok(config)
    }
}

// Hand-written so secrets never end up in logs
impl fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field(
                "session_cookie",
                &self.session_cookie.as_ref().map(|_| "<redacted>"),
            )
            .field("origin", &self.origin)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
