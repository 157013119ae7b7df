//! Server configuration.
//!
//! Loaded from three layers (in priority order): compiled defaults, an
//! optional JSON file, and `RELAY_*` environment variables.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Maximum concurrent in-flight calls per session.
    pub max_in_flight_per_session: usize,
    /// Deadline for a unary backend call, in seconds.
    pub unary_deadline_secs: u64,
    /// Deadline covering a whole streaming backend call, in seconds.
    pub stream_deadline_secs: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat timeout in seconds (close after this long without a pong).
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Grace period for draining sessions on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 50,
            max_in_flight_per_session: 100,
            unary_deadline_secs: 10,
            stream_deadline_secs: 30,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            shutdown_grace_secs: 5,
        }
    }
}

/// Configuration loading failure.
#[derive(Debug, thiserror::Error)]
#[error("failed to load configuration: {0}")]
pub struct ConfigError(#[from] figment::Error);

impl ServerConfig {
    /// Load configuration: defaults, then an optional JSON file, then
    /// `RELAY_*` environment variables (highest priority).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file_exact(path));
        }
        Ok(figment.merge(Env::prefixed("RELAY_")).extract()?)
    }

    /// Unary call deadline.
    pub fn unary_deadline(&self) -> Duration {
        Duration::from_secs(self.unary_deadline_secs)
    }

    /// Whole-stream call deadline.
    pub fn stream_deadline(&self) -> Duration {
        Duration::from_secs(self.stream_deadline_secs)
    }

    /// Interval between server-initiated Ping frames.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// How long without a Pong before the client is considered dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Shutdown drain grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
