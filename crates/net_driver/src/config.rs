//! Driver configuration.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! port = 7777
//! tick_ms = 0
//!
//! [server_queue]
//! capacity = 1024
//! overflow = "drop_oldest"
//! ```

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_PEERS, DEFAULT_PORT,
    DEFAULT_TICK,
};

/// What a bounded outbound queue does when a producer pushes into a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// The producer waits until the loop frees a slot.
    #[default]
    Block,
    /// The incoming message is discarded.
    DropNewest,
    /// The oldest queued message is discarded to make room.
    DropOldest,
}

/// Bound and overflow behaviour of one outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued messages; `None` leaves the queue unbounded.
    pub capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl QueueConfig {
    pub const fn unbounded() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::Block,
        }
    }

    pub const fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: Some(capacity),
            overflow,
        }
    }
}

/// Settings for one [`NetworkDriver`](crate::NetworkDriver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Port the hosted server listens on, also used for codes without a port.
    pub port: u16,
    pub max_peers: u16,
    pub connect_attempts: u32,
    /// Per-attempt connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Idle pause between loop iterations in milliseconds. Zero busy-polls.
    pub tick_ms: u64,
    pub client_queue: QueueConfig,
    pub server_queue: QueueConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_peers: DEFAULT_MAX_PEERS,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            tick_ms: DEFAULT_TICK.as_millis() as u64,
            client_queue: QueueConfig::unbounded(),
            server_queue: QueueConfig::unbounded(),
        }
    }
}

impl DriverConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1"));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid("connect_attempts must be at least 1"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be at least 1"));
        }
        for queue in [&self.client_queue, &self.server_queue] {
            if queue.capacity == Some(0) {
                return Err(ConfigError::Invalid("queue capacity must be at least 1"));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Upper bound for a whole connect handshake, after which the loop gives up on its own.
    pub fn connect_deadline(&self) -> Duration {
        self.connect_timeout() * self.connect_attempts
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = DriverConfig::from_toml_str("").unwrap();
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.port, 7777);
        assert_eq!(config.max_peers, 256);
        assert_eq!(config.connect_attempts, 5);
    }

    #[test]
    fn test_partial_document_overrides_only_named_fields() {
        let config = DriverConfig::from_toml_str(
            r#"
            port = 9000
            tick_ms = 0

            [server_queue]
            capacity = 16
            overflow = "drop_oldest"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.tick(), Duration::ZERO);
        assert_eq!(
            config.server_queue,
            QueueConfig::bounded(16, OverflowPolicy::DropOldest)
        );
        assert_eq!(config.client_queue, QueueConfig::unbounded());
        assert_eq!(config.max_peers, DEFAULT_MAX_PEERS);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        for source in [
            "max_peers = 0",
            "connect_attempts = 0",
            "connect_timeout_ms = 0",
            "[client_queue]\ncapacity = 0",
        ] {
            let result = DriverConfig::from_toml_str(source);
            assert!(
                matches!(result, Err(ConfigError::Invalid(_))),
                "expected rejection for {source:?}"
            );
        }
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        let result = DriverConfig::from_toml_str("port = \"not a number\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_serialized_config_parses_back() {
        let mut config = DriverConfig::default();
        config.client_queue = QueueConfig::bounded(8, OverflowPolicy::DropNewest);
        let text = config.to_toml_string().unwrap();
        assert_eq!(DriverConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_connect_deadline_spans_all_attempts() {
        let config = DriverConfig {
            connect_attempts: 3,
            connect_timeout_ms: 200,
            ..DriverConfig::default()
        };
        assert_eq!(config.connect_deadline(), Duration::from_millis(600));
    }
}
