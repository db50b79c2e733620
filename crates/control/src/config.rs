use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::connection::ConnectOptions;
use crate::error::ConfigError;
use crate::ipc::{AgentAddress, DEFAULT_AGENT_ADDR};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1_000;

pub const ENV_AGENT_ADDR: &str = "WORKERD_AGENT_ADDR";
pub const ENV_IDENT: &str = "WORKERD_IDENT";
pub const ENV_SECRET: &str = "WORKERD_SECRET";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "WORKERD_CONNECT_TIMEOUT_MS";

/// Settings the embedding process hands to [`crate::ControlDaemon`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_agent_address")]
    pub address: String,
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: default_agent_address(),
            identity: default_identity(),
            secret: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

pub fn default_agent_address() -> String {
    DEFAULT_AGENT_ADDR.to_string()
}

pub fn default_identity() -> String {
    format!("worker:{}", std::process::id())
}

pub fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

pub fn default_close_timeout_ms() -> u64 {
    DEFAULT_CLOSE_TIMEOUT_MS
}

pub fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl ControlConfig {
    pub fn new(address: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            identity: identity.into(),
            ..Self::default()
        }
    }

    /// Read a TOML file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `WORKERD_*` variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(address) = non_empty(ENV_AGENT_ADDR) {
            self.address = address;
        }
        if let Some(identity) = non_empty(ENV_IDENT) {
            self.identity = identity;
        }
        if let Some(secret) = non_empty(ENV_SECRET) {
            self.secret = Some(secret);
        }
        if let Some(raw) = non_empty(ENV_CONNECT_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(value) => self.connect_timeout_ms = value,
                Err(err) => warn!("Invalid {} value '{}': {}", ENV_CONNECT_TIMEOUT_MS, raw, err),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.address
            .parse::<AgentAddress>()
            .map_err(|err| ConfigError::InvalidValue {
                key: "address".into(),
                message: err.to_string(),
            })?;
        if self.identity.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "identity".into(),
                message: "must not be empty".into(),
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_frame_bytes".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            secret: self.secret.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}
