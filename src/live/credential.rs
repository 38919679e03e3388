//! Daemon credential issuance
//!
//! Before opening a socket the panel backend is asked for a short-lived token
//! plus the socket address of the daemon hosting the entity.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::PanelConfig;

/// Short-lived daemon credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    /// Unix seconds
    pub expires_at: i64,
    /// `wss://` address of the daemon socket for this entity
    pub connection_string: String,
    pub permissions: Vec<String>,
}

impl Credential {
    pub fn expires_at_ms(&self) -> i64 {
        self.expires_at.saturating_mul(1000)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("connection_string", &self.connection_string)
            .field("permissions", &self.permissions.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Transport failure talking to the panel
    Request(String),
    /// Non-2xx response
    Status(u16, String),
    /// Panel answered but refused (`success: false` or missing data)
    Rejected(String),
    Decode(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e) => write!(f, "credential request failed: {e}"),
            Self::Status(code, body) => write!(f, "credential endpoint returned {code}: {body}"),
            Self::Rejected(msg) => write!(f, "credential rejected: {msg}"),
            Self::Decode(e) => write!(f, "credential response malformed: {e}"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Source of daemon credentials
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch(&self, entity_id: &str) -> Result<Credential, CredentialError>;
}

#[derive(Debug, Deserialize)]
struct JwtEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    data: Option<JwtData>,
}

#[derive(Debug, Deserialize)]
struct JwtData {
    token: String,
    expires_at: i64,
    connection_string: String,
    #[serde(default)]
    permissions: Vec<String>,
}

impl JwtEnvelope {
    fn into_credential(self) -> Result<Credential, CredentialError> {
        if !self.success {
            let reason = self
                .error_message
                .or(self.message)
                .unwrap_or_else(|| "panel refused to issue a token".to_string());
            return Err(CredentialError::Rejected(reason));
        }

        let data = self
            .data
            .ok_or_else(|| CredentialError::Rejected("response carried no token".to_string()))?;

        if data.token.is_empty() || data.connection_string.is_empty() {
            return Err(CredentialError::Rejected(
                "token or connection string missing".to_string(),
            ));
        }

        Ok(Credential {
            token: data.token,
            expires_at: data.expires_at,
            connection_string: data.connection_string,
            permissions: data.permissions,
        })
    }
}

/// Fetches credentials from `POST {panel}/api/user/servers/{id}/jwt`
#[derive(Clone)]
pub struct PanelCredentialFetcher {
    client: Client,
    base_url: String,
}

impl PanelCredentialFetcher {
    pub fn new(config: &PanelConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::ACCEPT,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                if let Some(key) = &config.api_key {
                    headers.insert(
                        reqwest::header::AUTHORIZATION,
                        format!("Bearer {}", key)
                            .parse()
                            .context("Invalid panel api key")?,
                    );
                }
                if let Some(cookie) = &config.session_cookie {
                    headers.insert(
                        reqwest::header::COOKIE,
                        cookie.parse().context("Invalid panel session cookie")?,
                    );
                }
                headers
            })
            .build()
            .context("Failed to build panel client")?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    #[inline]
    fn url(&self, entity_id: &str) -> String {
        format!("{}/api/user/servers/{}/jwt", self.base_url, entity_id)
    }
}

#[async_trait]
impl CredentialFetcher for PanelCredentialFetcher {
    async fn fetch(&self, entity_id: &str) -> Result<Credential, CredentialError> {
        let resp = self
            .client
            .post(self.url(entity_id))
            .send()
            .await
            .map_err(|e| CredentialError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CredentialError::Status(status.as_u16(), text));
        }

        let envelope = resp
            .json::<JwtEnvelope>()
            .await
            .map_err(|e| CredentialError::Decode(e.to_string()))?;

        let credential = envelope.into_credential()?;
        debug!(
            entity = %entity_id,
            expires_at = credential.expires_at,
            "credential_issued"
        );
        Ok(credential)
    }
}
