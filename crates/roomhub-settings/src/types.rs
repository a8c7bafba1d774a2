//! Settings tree. Every section is `#[serde(default)]` so a partial
//! settings file only needs to name what it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Bytes of the smallest frame that carries chat content:
/// `{"type":"message","data":{"content":""}}`.
const MESSAGE_FRAME_OVERHEAD: usize = 40;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomhubSettings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub heartbeat: HeartbeatSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

impl RoomhubSettings {
    /// Reject combinations the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.hub.outbound_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.outboundQueueCapacity must be at least 1".into(),
            ));
        }
        if self.hub.channel_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.channelCapacity must be at least 1".into(),
            ));
        }
        if self.heartbeat.ping_interval_ms == 0 || self.heartbeat.check_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat intervals must be non-zero".into(),
            ));
        }
        if self.heartbeat.liveness_timeout_ms <= self.heartbeat.check_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeat.livenessTimeoutMs ({}) must exceed heartbeat.checkIntervalMs ({})",
                self.heartbeat.liveness_timeout_ms, self.heartbeat.check_interval_ms
            )));
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageSize must be non-zero".into(),
            ));
        }
        // Every character takes at least one byte, so a longer limit could
        // never be reached through a frame the server accepts.
        if self.hub.max_content_length + MESSAGE_FRAME_OVERHEAD > self.server.max_message_size {
            return Err(SettingsError::InvalidValue(format!(
                "hub.maxContentLength ({}) does not fit in server.maxMessageSize ({} bytes)",
                self.hub.max_content_length, self.server.max_message_size
            )));
        }
        Ok(())
    }
}

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Largest inbound frame accepted from a client, in bytes.
    pub max_message_size: usize,
    /// Deadline for a single socket write.
    pub write_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 4096,
            write_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Fan-out and queueing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Per-connection outbound queue bound. A full queue evicts the connection.
    pub outbound_queue_capacity: usize,
    /// Bound of each hub request channel.
    pub channel_capacity: usize,
    /// Longest chat message accepted, in characters.
    pub max_content_length: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            channel_capacity: 1024,
            max_content_length: 1000,
        }
    }
}

/// Liveness probing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Cadence of transport-level pings sent to each client.
    pub ping_interval_ms: u64,
    /// How often each connection's last pong is inspected.
    pub check_interval_ms: u64,
    /// Silence after which a connection is declared dead.
    pub liveness_timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 54_000,
            check_interval_ms: 30_000,
            liveness_timeout_ms: 90_000,
        }
    }
}

impl HeartbeatSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

/// Message persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite file. Relative paths resolve against `~/.roomhub`.
    pub database_path: String,
    /// Keep history in memory only.
    pub in_memory: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "messages.db".to_string(),
            in_memory: false,
        }
    }
}

impl StorageSettings {
    pub fn resolved_database_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.database_path);
        if path.is_absolute() {
            path
        } else {
            crate::loader::roomhub_dir().join(path)
        }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module overrides, e.g. `{"roomhub_server::hub": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}
