//! Settings types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Routes the server always mounts.
const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener, routing, and queue sizing.
    pub server: ServerSettings,
    /// Log level and output format.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.mailbox_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.mailboxCapacity must be greater than 0".into(),
            ));
        }
        if server.broadcast_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.broadcastQueueCapacity must be greater than 0".into(),
            ));
        }
        if server.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageSize must be greater than 0".into(),
            ));
        }
        if !server.ws_path.starts_with('/') || server.ws_path.len() < 2 {
            return Err(SettingsError::InvalidValue(format!(
                "server.wsPath must be an absolute path, got {:?}",
                server.ws_path
            )));
        }
        if RESERVED_PATHS.contains(&server.ws_path.as_str()) {
            return Err(SettingsError::InvalidValue(format!(
                "server.wsPath {:?} collides with a built-in route",
                server.ws_path
            )));
        }
        if server.idle_timeout_secs == Some(0) {
            return Err(SettingsError::InvalidValue(
                "server.idleTimeoutSecs must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listener port (`0` picks a free port).
    pub port: u16,
    /// Path routed to the WebSocket upgrade.
    pub ws_path: String,
    /// Directory served for every other path.
    pub static_dir: PathBuf,
    /// Per-connection outbound queue length. A connection whose queue is full
    /// when a broadcast arrives is disconnected.
    pub mailbox_capacity: usize,
    /// Pending broadcasts buffered ahead of the dispatch loop.
    pub broadcast_queue_capacity: usize,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
    /// Close connections that send nothing for this long. Unset disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    /// How long shutdown waits for background tasks.
    pub shutdown_timeout_secs: u64,
}

impl ServerSettings {
    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Shutdown grace period as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            ws_path: "/ws".to_string(),
            static_dir: PathBuf::from("static"),
            mailbox_capacity: 256,
            broadcast_queue_capacity: 1024,
            max_message_size: 64 * 1024,
            idle_timeout_secs: None,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(SettingsError::InvalidValue(format!(
                "unknown log format {other:?} (expected \"pretty\" or \"json\")"
            ))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` wins when set).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
