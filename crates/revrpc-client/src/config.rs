//! Endpoint configuration at `~/.revrpc/config.toml`.
//!
//! Shared by users and resources: where the relay is, who this endpoint is,
//! and how hard to try connecting. CLI flags override file values.

use crate::transport::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

/// `[endpoint]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Relay host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Relay port. Users dial it directly; resources dial `port + 1`
    /// unless `resource_port` is set.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub resource_port: Option<u16>,

    /// Resource name announced at registration.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Largest SEND payload this resource accepts.
    #[serde(default = "default_command_data_limit")]
    pub command_data_limit: u32,

    /// Log every frame at trace level.
    #[serde(default)]
    pub transport_log: bool,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Hex Ed25519 secret used to sign registrations (created if missing).
    #[serde(default)]
    pub key_file: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            resource_port: None,
            name: String::new(),
            description: String::new(),
            command_data_limit: default_command_data_limit(),
            transport_log: false,
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            key_file: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7070
}

fn default_command_data_limit() -> u32 {
    16 * 1024 * 1024
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    250
}

impl EndpointConfig {
    /// Load the `[endpoint]` section, returning defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let file: ConfigFile =
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(file.endpoint)
    }

    /// `~/.revrpc/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".revrpc")
            .join("config.toml")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count).with_delay(Duration::from_millis(self.retry_delay_ms))
    }

    pub fn resource_port(&self) -> u16 {
        self.resource_port
            .unwrap_or_else(|| self.port.saturating_add(1))
    }

    pub fn key_path(&self) -> Option<PathBuf> {
        self.key_file.as_deref().map(|k| expand_tilde(Path::new(k)))
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
