//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::packet::DEFAULT_MAX_PAYLOAD_LEN;

/// How frames are carried by the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// One binary WebSocket message per frame.
    #[default]
    Websocket,
    /// Frames back to back on a raw TCP byte stream.
    Stream,
}

impl std::fmt::Display for FrameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Websocket => write!(f, "websocket"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

impl std::str::FromStr for FrameMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::Websocket),
            "stream" | "tcp" => Ok(Self::Stream),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown frame mode '{other}'"
            ))),
        }
    }
}

/// Configuration for a tidewire server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// HTTP path of the WebSocket upgrade endpoint.
    pub ws_path: String,
    /// Transport framing mode.
    pub frame_mode: FrameMode,
    /// Maximum concurrently registered connections.
    pub max_connections: usize,
    /// Capacity of each connection's outbound frame queue.
    pub max_outbound_queue_len: usize,
    /// Number of dispatch workers; `0` spawns one task per message.
    pub worker_pool_size: usize,
    /// Capacity of each worker's task queue.
    pub max_worker_task_len: usize,
    /// Seconds without inbound traffic before a connection is considered dead.
    pub heartbeat_timeout_secs: u64,
    /// Seconds between liveness sweeps over all connections.
    pub heartbeat_check_interval_secs: u64,
    /// Largest payload accepted or produced by the codec, in bytes.
    pub max_payload_len: usize,
    /// Upper bound on a single handler invocation; `0` disables the bound.
    pub handler_timeout_secs: u64,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ws_path: "/ws".into(),
            frame_mode: FrameMode::Websocket,
            max_connections: 1024,
            max_outbound_queue_len: 1024,
            worker_pool_size: 0,
            max_worker_task_len: 1024,
            heartbeat_timeout_secs: 30,
            heartbeat_check_interval_secs: 5,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            handler_timeout_secs: 60,
            log_level: "info".into(),
        }
    }
}

impl ServerConfig {
    /// Liveness window as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Liveness sweep interval as a [`Duration`].
    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_interval_secs)
    }

    /// Handler bound, if enabled.
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_secs > 0).then(|| Duration::from_secs(self.handler_timeout_secs))
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_outbound_queue_len == 0 {
            return Err(ConfigError::InvalidValue(
                "max_outbound_queue_len must be at least 1".into(),
            ));
        }
        if self.worker_pool_size > 0 && self.max_worker_task_len == 0 {
            return Err(ConfigError::InvalidValue(
                "max_worker_task_len must be at least 1 when worker_pool_size > 0".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.max_payload_len > u32::MAX as usize {
            return Err(ConfigError::InvalidValue(format!(
                "max_payload_len {} does not fit the 32-bit length field",
                self.max_payload_len
            )));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_timeout_secs must be at least 1".into(),
            ));
        }
        if self.heartbeat_check_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_check_interval_secs must be at least 1".into(),
            ));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "ws_path '{}' must start with '/'",
                self.ws_path
            )));
        }
        Ok(())
    }
}
