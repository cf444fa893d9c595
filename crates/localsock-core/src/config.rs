//! Configuration for localsock (localsock.toml).
//!
//! Every section is optional; missing keys fall back to defaults.

use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "LOCALSOCK_CONFIG";

/// Largest payload a scenario may exchange. Both sides write before the
/// peer reads, so the payload has to fit the socket buffers.
pub const MAX_SCENARIO_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-connection socket options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Read deadline in milliseconds; 0 blocks forever.
    pub read_timeout_ms: u64,
    /// Write deadline in milliseconds; 0 blocks forever.
    pub write_timeout_ms: u64,
}

impl SocketOptions {
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Options applied when binding a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerOptions {
    /// Remove a leftover socket file whose listener is gone, then bind.
    pub reclaim_stale: bool,
    /// Permission bits for the socket file (e.g. `0o600`).
    pub socket_mode: Option<u32>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            reclaim_stale: true,
            socket_mode: None,
        }
    }
}

/// Parameters for the availability scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Bytes written in each direction.
    pub bytes: usize,
    /// Sleep between the peer's write and the local read, in milliseconds.
    pub settle_ms: u64,
    /// How long to wait for the server side to finish, in milliseconds.
    pub deadline_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            bytes: 23,
            settle_ms: 100,
            deadline_ms: 2000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket: SocketOptions,
    pub listener: ListenerOptions,
    pub scenario: ScenarioConfig,
    pub logging: LogConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file that must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from the explicit path, `$LOCALSOCK_CONFIG`, or the default
    /// location. Only the default location may be absent.
    pub fn load_resolved(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                tracing::debug!("no config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    /// `<config_dir>/localsock/localsock.toml`
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("localsock").join("localsock.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenario.bytes > MAX_SCENARIO_BYTES {
            return Err(ConfigError::Invalid(format!(
                "scenario.bytes must be at most {MAX_SCENARIO_BYTES}, got {}",
                self.scenario.bytes
            )));
        }
        if self.scenario.deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "scenario.deadline_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(mode) = self.listener.socket_mode {
            if mode > 0o777 {
                return Err(ConfigError::Invalid(format!(
                    "listener.socket_mode {mode:#o} has bits outside 0o777"
                )));
            }
        }
        Ok(())
    }
}
