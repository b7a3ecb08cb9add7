//! Server configuration.
//!
//! Every field has a default; `COLLAB_*` environment variables override them
//! (`COLLAB_BIND_ADDR`, `COLLAB_SAVE_DELAY_MS`, `COLLAB_STORAGE_PATH`, ...).
//! A `.env` file in the working directory is read first when present.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::DEFAULT_ROOM;

pub const ENV_PREFIX: &str = "COLLAB_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Quiet period before a room's state is written
    pub save_delay_ms: u64,
    /// Outbound frames buffered per connection before frames are dropped
    pub outbound_capacity: usize,
    /// Largest inbound frame accepted
    pub max_frame_bytes: usize,
    /// Presence not refreshed for this long is retired
    pub awareness_timeout_secs: u64,
    /// How often idle presence is swept
    pub awareness_sweep_ms: u64,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Room used when the request path names none
    pub default_room: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            save_delay_ms: 2000,
            outbound_capacity: 256,
            max_frame_bytes: 1024 * 1024,
            awareness_timeout_secs: 30,
            awareness_sweep_ms: 5000,
            storage_path: None,
            default_room: DEFAULT_ROOM.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable error: {0}")]
    Env(#[from] envy::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Load from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                log::warn!("Ignoring unreadable .env file: {e}");
            }
        }
        let config: Self = envy::prefixed(ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from explicit key/value pairs (unprefixed keys are ignored).
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX).from_iter(pairs)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid("outbound_capacity must be at least 1".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be at least 1".into()));
        }
        if self.awareness_timeout_secs == 0 {
            return Err(ConfigError::Invalid("awareness_timeout_secs must be at least 1".into()));
        }
        if self.awareness_sweep_ms == 0 {
            return Err(ConfigError::Invalid("awareness_sweep_ms must be at least 1".into()));
        }
        if self.default_room.is_empty() {
            return Err(ConfigError::Invalid("default_room must not be empty".into()));
        }
        Ok(())
    }

    pub fn save_delay(&self) -> Duration {
        Duration::from_millis(self.save_delay_ms)
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_secs(self.awareness_timeout_secs)
    }

    pub fn awareness_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.awareness_sweep_ms)
    }

    /// Defaults suited to tests: ephemeral port, short save delay.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            save_delay_ms: 100,
            awareness_sweep_ms: 50,
            ..Self::default()
        }
    }
}
