//! Configuration for the channel link
//!
//! Loaded from a TOML file. Every section and field is optional; missing
//! values fall back to the defaults below.
//!
//! ```toml
//! [bus]
//! host = "127.0.0.1"
//! port = 1883
//! channel = "room1"
//!
//! [lifecycle]
//! debounce_ms = 500
//! heartbeat_interval_secs = 1200
//! ```

use crate::protocol::validate_channel;
use crate::sink::DEFAULT_LOG_CAPACITY;
use crate::transport::{ClientOptions, Endpoint};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub bus: BusSection,
    pub lifecycle: LifecycleSection,
    pub log: LogSection,
}

/// Bus section: default target and client options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusSection {
    pub host: String,
    pub port: u16,
    pub channel: String,
    /// Constant delay between link-level reconnection attempts
    pub reconnect_delay_secs: u64,
    pub keep_alive_secs: u64,
    /// How long to wait for the broker to acknowledge a link
    pub connect_timeout_ms: u64,
    /// How long a publish/subscribe command may take
    pub command_timeout_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            channel: "room1".to_string(),
            reconnect_delay_secs: 10,
            keep_alive_secs: 60,
            connect_timeout_ms: 5000,
            command_timeout_ms: 5000,
        }
    }
}

/// Lifecycle section: debounce and heartbeat timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleSection {
    pub debounce_ms: u64,
    /// Heartbeat period (default: 1200 = 20 minutes)
    pub heartbeat_interval_secs: u64,
    /// Delay before the first heartbeat after subscribing
    pub heartbeat_initial_delay_ms: u64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            heartbeat_interval_secs: 1200,
            heartbeat_initial_delay_ms: 1000,
        }
    }
}

/// Log section: in-memory event log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSection {
    pub capacity: usize,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid channel name '{channel}': {reason}")]
    InvalidChannel { channel: String, reason: String },
}

impl LinkConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_channel_name(&self.bus.channel)?;

        if self.bus.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "bus.host must not be empty".to_string(),
            ));
        }
        if self.bus.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "bus.port must be non-zero".to_string(),
            ));
        }

        let non_zero = [
            ("bus.connect_timeout_ms", self.bus.connect_timeout_ms),
            ("bus.command_timeout_ms", self.bus.command_timeout_ms),
            ("lifecycle.debounce_ms", self.lifecycle.debounce_ms),
            (
                "lifecycle.heartbeat_interval_secs",
                self.lifecycle.heartbeat_interval_secs,
            ),
            ("log.capacity", self.log.capacity as u64),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{field} must be non-zero"
                )));
            }
        }

        Ok(())
    }

    /// Default connection target
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.bus.host.clone(), self.bus.port)
    }

    /// Options every bus client is created with
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            reconnect_delay: Duration::from_secs(self.bus.reconnect_delay_secs),
            keep_alive: Duration::from_secs(self.bus.keep_alive_secs),
            connect_timeout: Duration::from_millis(self.bus.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.bus.command_timeout_ms),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.lifecycle.debounce_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.heartbeat_interval_secs)
    }

    pub fn heartbeat_initial_delay(&self) -> Duration {
        Duration::from_millis(self.lifecycle.heartbeat_initial_delay_ms)
    }
}

/// Validate a channel name, mapping the failure to a configuration error
pub fn validate_channel_name(channel: &str) -> Result<(), ConfigError> {
    validate_channel(channel).map_err(|e| ConfigError::InvalidChannel {
        channel: channel.to_string(),
        reason: e.to_string(),
    })
}
