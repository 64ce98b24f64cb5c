use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }

    /// Apply the `PORT` environment override, if present.
    pub fn apply_env(&mut self, port: Option<&str>) -> Result<(), ConfigError> {
        if let Some(raw) = port {
            self.server.port = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(raw.to_string()))?;
        }
        Ok(())
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout() -> u64 {
    90
}

// ============================================================================
// ConnectionConfig
// ============================================================================

/// Retry budget and reconnect delays.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Consecutive failures before the session is wiped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before an ordinary reconnect.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    /// Delay before reconnecting after the retry budget wiped the session.
    #[serde(default = "default_session_reset_delay")]
    pub session_reset_delay_ms: u64,
    /// Delay before reconnecting after a manual restart.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
    /// Delay before reconnecting after a manual session clear.
    #[serde(default = "default_clear_session_delay")]
    pub clear_session_delay_ms: u64,
}

impl ConnectionConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn session_reset_delay(&self) -> Duration {
        Duration::from_millis(self.session_reset_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn clear_session_delay(&self) -> Duration {
        Duration::from_millis(self.clear_session_delay_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval(),
            session_reset_delay_ms: default_session_reset_delay(),
            restart_delay_ms: default_restart_delay(),
            clear_session_delay_ms: default_clear_session_delay(),
        }
    }
}

fn default_max_retries() -> u32 {
    6
}

fn default_retry_interval() -> u64 {
    5000
}

fn default_session_reset_delay() -> u64 {
    3000
}

fn default_restart_delay() -> u64 {
    2000
}

fn default_clear_session_delay() -> u64 {
    3000
}

// ============================================================================
// SessionConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Directory holding the session credentials.
    #[serde(default = "default_session_path")]
    pub path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: default_session_path(),
        }
    }
}

fn default_session_path() -> PathBuf {
    PathBuf::from("session")
}

// ============================================================================
// BridgeConfig
// ============================================================================

/// How to launch the chat-network bridge process.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Upper bound on a single send or group query.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: Vec::new(),
            query_timeout_ms: default_query_timeout(),
        }
    }
}

fn default_bridge_command() -> String {
    "wagate-bridge".to_string()
}

fn default_query_timeout() -> u64 {
    60_000
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

// ============================================================================
// Tests
// ============================================================================
