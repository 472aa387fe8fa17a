//! Broker configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables. Every field has a default, so an empty file is valid.
//!
//! ```toml
//! pipe_dir = "/run/user/1000/pipebus"
//! registration_pipe = "register_pipe"
//! poll_interval_ms = 1
//! lock_mode = "read_write"   # or "exclusive"
//! lock_retry_ms = 1
//! lock_timeout_ms = 2000     # omit to wait forever
//! response_timeout_ms = 5000
//! max_sessions = 100
//! shutdown = "stop_sessions" # or "leave_sessions"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pipebus_core::{
    default_pipe_dir, ChannelConfig, ChannelPaths, LockConfig, LockMode, DEFAULT_REGISTRATION_PIPE,
};

use crate::registry::{Shutdown, MAX_SESSIONS};
use crate::session::SessionSettings;

/// Overrides [`BrokerConfig::pipe_dir`].
pub const ENV_PIPE_DIR: &str = "PIPEBUS_DIR";

/// Overrides [`BrokerConfig::registration_pipe`].
pub const ENV_REGISTRATION_PIPE: &str = "PIPEBUS_REGISTRATION_PIPE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Directory holding every pipe and lock file.
    pub pipe_dir: PathBuf,
    /// File name of the registration pipe inside `pipe_dir`.
    pub registration_pipe: String,
    pub poll_interval_ms: u64,
    pub lock_mode: LockMode,
    pub lock_retry_ms: u64,
    pub lock_timeout_ms: Option<u64>,
    /// How long a session waits for its client to open the response pipe.
    pub response_timeout_ms: Option<u64>,
    pub max_sessions: usize,
    pub shutdown: Shutdown,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pipe_dir: default_pipe_dir(),
            registration_pipe: DEFAULT_REGISTRATION_PIPE.to_string(),
            poll_interval_ms: 1,
            lock_mode: LockMode::default(),
            lock_retry_ms: 1,
            lock_timeout_ms: None,
            response_timeout_ms: Some(5_000),
            max_sessions: MAX_SESSIONS,
            shutdown: Shutdown::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` (or the defaults when `None`) and applies env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies environment-style overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = lookup(ENV_PIPE_DIR) {
            self.pipe_dir = PathBuf::from(dir);
        }
        if let Some(name) = lookup(ENV_REGISTRATION_PIPE) {
            self.registration_pipe = name;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registration_pipe.is_empty() || self.registration_pipe.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "registration_pipe must be a plain file name, got {:?}",
                self.registration_pipe
            )));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn paths(&self) -> ChannelPaths {
        ChannelPaths::new(&self.pipe_dir, &self.registration_pipe)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            lock: LockConfig {
                mode: self.lock_mode,
                retry_interval: Duration::from_millis(self.lock_retry_ms),
                timeout: self.lock_timeout_ms.map(Duration::from_millis),
            },
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            write_timeout: None,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            channel: self.channel_config(),
            response_timeout: self.response_timeout_ms.map(Duration::from_millis),
        }
    }
}
