//! Client configuration

use crate::error::{Error, Result};
use crate::transport::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SOCKET_URL: &str = "ws://localhost:8080/chat";

/// Environment variable overriding the broker URL.
pub const SOCKET_URL_ENV: &str = "SOCKET_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub socket_url: String,
    pub handshake_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub send_wait_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub call: CallConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Unanswered outgoing calls are cancelled after this long. `None` rings forever.
    pub ring_timeout_secs: Option<u64>,
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            handshake_timeout_ms: 3000,
            heartbeat_ms: 4000,
            send_wait_ms: 5000,
            reconnect: ReconnectPolicy::default(),
            call: CallConfig::default(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: Some(45),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl ClientConfig {
    pub fn new(socket_url: &str) -> Self {
        Self {
            socket_url: socket_url.to_string(),
            ..Default::default()
        }
    }

    /// Defaults with `SOCKET_URL` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a JSON config file if it exists, then apply the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(SOCKET_URL_ENV) {
            if !url.trim().is_empty() {
                self.socket_url = url.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.socket_url)
            .map_err(|e| Error::Config(format!("invalid socket_url {}: {}", self.socket_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "socket_url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.handshake_timeout_ms == 0 || self.send_wait_ms == 0 {
            return Err(Error::Config("timeouts must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_wait(&self) -> Duration {
        Duration::from_millis(self.send_wait_ms)
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_secs.map(Duration::from_secs)
    }
}
