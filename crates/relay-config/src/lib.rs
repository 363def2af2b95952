//! Configuration for Relay RPC connections.
//!
//! Configuration is read from TOML:
//!
//! ```toml
//! [logging]
//! level = "relay.rpc=debug,info"
//! json = false
//!
//! [connection]
//! write_queue_capacity = 256
//! max_frame_len = 67108864
//! drain_timeout_ms = 5000
//! ```
//!
//! Every table and key is optional; unknown keys are rejected.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod logging;

pub use logging::{init_tracing, LoggingConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-connection tuning shared by both ends of a connection.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Number of outbound messages that may wait for the writer task before senders are
    /// back-pressured.
    #[serde(default = "ConnectionConfig::default_write_queue_capacity")]
    pub write_queue_capacity: usize,

    /// Largest encoded message accepted or produced by the codec, in bytes.
    #[serde(default = "ConnectionConfig::default_max_frame_len")]
    pub max_frame_len: u32,

    /// How long `close` waits for in-flight handlers before cancelling them.
    ///
    /// Unset means wait until every handler returns on its own.
    #[serde(default)]
    pub drain_timeout_ms: Option<u64>,
}

impl ConnectionConfig {
    fn default_write_queue_capacity() -> usize {
        256
    }

    fn default_max_frame_len() -> u32 {
        relay_proto::DEFAULT_MAX_FRAME_LEN
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.write_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "connection.write_queue_capacity",
                message: "must be at least 1".into(),
            });
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Invalid {
                key: "connection.max_frame_len",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_queue_capacity: Self::default_write_queue_capacity(),
            max_frame_len: Self::default_max_frame_len(),
            drain_timeout_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a snippet of the input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl RelayConfig {
    /// Load a config file from TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(target: "relay.config", path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(text)?;
        config.connection.validate()?;
        Ok(config)
    }
}
