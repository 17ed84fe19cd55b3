//! Configuration for the signaling server
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! Environment variables override values read from the file.

use roomcast_signaling::RelayConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Main configuration for the signaling server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Relay behaviour (rooms, history, liveness, adaptation)
    #[serde(default)]
    pub relay: RelayConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind both listeners to
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket signaling port
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// HTTP status API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ws_port() -> u16 {
    8080
}

fn default_http_port() -> u16 {
    8081
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ws_port: default_ws_port(),
            http_port: default_http_port(),
        }
    }
}

impl ServerConfig {
    pub fn ws_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.host, self.ws_port)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.host, self.http_port)
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("bad listen address {}:{}: {}", host, port, e)))
}

/// Log output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: ServiceConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = ServiceConfig::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load configuration from `path` (defaults when `None`), then apply
    /// environment overrides.
    ///
    /// A path that was given but cannot be read is an error. The result is
    /// not validated; callers layer CLI flags on top first.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => ServiceConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override fields from `SIGNALING_*` variables.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server
        if let Some(host) = var("SIGNALING_HOST") {
            self.server.host = host;
        }
        if let Some(p) = var("SIGNALING_WS_PORT").and_then(|v| v.parse().ok()) {
            self.server.ws_port = p;
        }
        if let Some(p) = var("SIGNALING_HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.server.http_port = p;
        }

        // Relay
        if let Some(max) = var("SIGNALING_MAX_ROOM_MEMBERS").and_then(|v| v.parse().ok()) {
            self.relay.max_room_members = max;
        }
        if let Some(room) = var("SIGNALING_DEFAULT_ROOM") {
            self.relay.default_room = room;
        }
        if let Some(ms) = var("SIGNALING_HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.relay.liveness.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = var("SIGNALING_DEAD_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.relay.liveness.dead_connection_timeout_ms = ms;
        }

        // Logging
        if let Some(json) = var("SIGNALING_LOG_JSON").and_then(|v| v.parse().ok()) {
            self.logging.json = json;
        }
    }

    /// Check listener addresses and relay parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = self.server.ws_addr()?;
        let http = self.server.http_addr()?;
        if ws.port() != 0 && ws.port() == http.port() {
            return Err(ConfigError::Invalid(format!(
                "ws_port and http_port must differ, both are {}",
                ws.port()
            )));
        }
        self.relay
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
