//! Configuration for a shiplink node.
//!
//! Loaded from `~/.shiplink/config.toml` unless a path is given. Every field
//! has a default, so an empty or missing file yields a usable configuration
//! apart from the node identity, which [`ShipConfig::validate`] checks.

use crate::error::{ShipError, ShipResult};
use crate::ski::parse_ski;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipConfig {
    /// SKI of the local certificate.
    pub local_ski: String,
    /// SHIP ID announced to peers in the access-methods phase.
    pub local_ship_id: String,
    /// Handshake deadlines.
    pub handshake: HandshakeConfig,
    /// Framed transport settings.
    pub transport: TransportConfig,
}

impl ShipConfig {
    /// Check identity fields and durations, normalizing the local SKI.
    pub fn validate(mut self) -> ShipResult<Self> {
        self.local_ski = parse_ski(&self.local_ski)?;
        if self.local_ship_id.trim().is_empty() {
            return Err(ShipError::Config("local_ship_id must not be empty".into()));
        }
        self.handshake.validate()?;
        self.transport.validate()?;
        Ok(self)
    }
}

/// Handshake deadlines, all in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Wait for the init message exchange.
    pub cmi_timeout_ms: u64,
    /// Initial hello waiting period.
    pub hello_init_ms: u64,
    /// Waiting period granted on prolongation.
    pub hello_inc_ms: u64,
    /// Subtracted from a remote `waiting` value to schedule our prolongation request.
    pub hello_prolong_thr_inc_ms: u64,
    /// How long to wait for the answer to a prolongation request.
    pub hello_prolong_waiting_gap_ms: u64,
    /// Below this a prolongation is no longer scheduled and the hello aborts.
    pub hello_prolong_min_ms: u64,
    /// Deadline for each protocol, PIN and access-methods step.
    pub protocol_timeout_ms: u64,
    /// Upper bound on the close announce/confirm exchange.
    pub close_grace_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            cmi_timeout_ms: 10_000,
            hello_init_ms: 60_000,
            hello_inc_ms: 60_000,
            hello_prolong_thr_inc_ms: 30_000,
            hello_prolong_waiting_gap_ms: 15_000,
            hello_prolong_min_ms: 1_000,
            protocol_timeout_ms: 10_000,
            close_grace_ms: 500,
        }
    }
}

impl HandshakeConfig {
    pub fn cmi_timeout(&self) -> Duration {
        Duration::from_millis(self.cmi_timeout_ms)
    }

    pub fn hello_init(&self) -> Duration {
        Duration::from_millis(self.hello_init_ms)
    }

    pub fn hello_inc(&self) -> Duration {
        Duration::from_millis(self.hello_inc_ms)
    }

    pub fn hello_prolong_thr_inc(&self) -> Duration {
        Duration::from_millis(self.hello_prolong_thr_inc_ms)
    }

    pub fn hello_prolong_waiting_gap(&self) -> Duration {
        Duration::from_millis(self.hello_prolong_waiting_gap_ms)
    }

    pub fn hello_prolong_min(&self) -> Duration {
        Duration::from_millis(self.hello_prolong_min_ms)
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    fn validate(&self) -> ShipResult<()> {
        let required = [
            ("cmi_timeout_ms", self.cmi_timeout_ms),
            ("hello_init_ms", self.hello_init_ms),
            ("hello_inc_ms", self.hello_inc_ms),
            ("protocol_timeout_ms", self.protocol_timeout_ms),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(ShipError::Config(format!("handshake.{name} must be > 0")));
            }
        }
        if self.hello_prolong_min_ms > self.hello_prolong_thr_inc_ms {
            return Err(ShipError::Config(
                "handshake.hello_prolong_min_ms must not exceed hello_prolong_thr_inc_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Framed transport settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval between keep-alive pings.
    pub ping_interval_secs: u64,
    /// How long a ping may stay unanswered.
    pub pong_timeout_secs: u64,
    /// Deadline for a single frame write.
    pub write_timeout_secs: u64,
    /// Largest frame accepted or sent, header byte included.
    pub max_frame_size: usize,
    /// Capacity of the inbound and outbound frame queues.
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 50,
            pong_timeout_secs: 10,
            write_timeout_secs: 10,
            max_frame_size: 1024,
            channel_capacity: 64,
        }
    }
}

impl TransportConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    fn validate(&self) -> ShipResult<()> {
        // Smallest frame on the wire is the 2-byte init message.
        if self.max_frame_size < 2 {
            return Err(ShipError::Config("transport.max_frame_size must be >= 2".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ShipError::Config("transport.channel_capacity must be > 0".into()));
        }
        if self.ping_interval_secs == 0 {
            return Err(ShipError::Config("transport.ping_interval_secs must be > 0".into()));
        }
        Ok(())
    }
}

/// Load configuration from disk, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> ShipConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<ShipConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    ShipConfig::default()
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    shiplink_home().join("config.toml")
}

/// Get the default shiplink home directory.
pub fn shiplink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".shiplink")
}
