//! Relay configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

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

/// What happens when a Resource registers a name that is already live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Close the newcomer's connection.
    #[default]
    Reject,
    /// Drop the existing registration and register the newcomer.
    Replace,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub identity: IdentitySection,
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub resource_port: Option<u16>,
    #[serde(default = "default_command_data_limit")]
    pub command_data_limit: u32,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default)]
    pub allow_remote_stop: bool,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub transport_log: bool,
    /// Append the frame log to this file instead of `tracing`.
    #[serde(default)]
    pub transport_log_file: Option<String>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            resource_port: None,
            command_data_limit: default_command_data_limit(),
            duplicate_policy: DuplicatePolicy::default(),
            allow_remote_stop: false,
            handshake_timeout_secs: default_handshake_timeout(),
            transport_log: false,
            transport_log_file: None,
        }
    }
}

/// `[identity]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentitySection {
    /// Reject Resources that register without a public key.
    #[serde(default)]
    pub require_signature: bool,
    /// Hex SHA-256 fingerprints allowed to register. Empty allows any key.
    #[serde(default)]
    pub authorized_keys: Vec<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7070
}
fn default_command_data_limit() -> u32 {
    16 * 1024 * 1024
}
fn default_handshake_timeout() -> u64 {
    10
}

/// Values given on the command line. `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub resource_port: Option<u16>,
    pub command_data_limit: Option<u32>,
    pub duplicate_policy: Option<DuplicatePolicy>,
    pub allow_remote_stop: bool,
}

/// Resolved relay configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub resource_port: u16,
    pub command_data_limit: u32,
    pub duplicate_policy: DuplicatePolicy,
    pub allow_remote_stop: bool,
    pub handshake_timeout: Duration,
    pub transport_log: bool,
    pub transport_log_file: Option<PathBuf>,
    pub require_signature: bool,
    pub authorized_keys: Vec<String>,
    pub key_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &Overrides::default())
    }
}

impl RelayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content =
                        std::fs::read_to_string(&expanded).map_err(|source| ConfigError::Read {
                            path: expanded.clone(),
                            source,
                        })?;
                    toml::from_str::<ConfigFile>(&content).map_err(|source| {
                        ConfigError::Parse {
                            path: expanded,
                            source,
                        }
                    })?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, overrides))
    }

    fn resolve(file: ConfigFile, overrides: &Overrides) -> Self {
        let ConfigFile { relay, identity } = file;
        let port = overrides.port.unwrap_or(relay.port);
        let resource_port = overrides
            .resource_port
            .or(relay.resource_port)
            .unwrap_or_else(|| port.saturating_add(1));

        Self {
            host: overrides.host.clone().unwrap_or(relay.host),
            port,
            resource_port,
            command_data_limit: overrides
                .command_data_limit
                .unwrap_or(relay.command_data_limit),
            duplicate_policy: overrides.duplicate_policy.unwrap_or(relay.duplicate_policy),
            allow_remote_stop: overrides.allow_remote_stop || relay.allow_remote_stop,
            handshake_timeout: Duration::from_secs(relay.handshake_timeout_secs.max(1)),
            transport_log: relay.transport_log,
            transport_log_file: relay
                .transport_log_file
                .as_deref()
                .map(|f| expand_tilde(Path::new(f))),
            require_signature: identity.require_signature,
            authorized_keys: identity
                .authorized_keys
                .iter()
                .map(|k| k.trim().to_ascii_lowercase())
                .collect(),
            key_path: identity.key_file.as_deref().map(|k| expand_tilde(Path::new(k))),
        }
    }

    /// `~/.revrpc/relay.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".revrpc")
            .join("relay.toml")
    }

    /// Loopback relay on ephemeral ports.
    pub fn ephemeral() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            resource_port: 0,
            ..Self::default()
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
