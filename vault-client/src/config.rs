//! Client config: TOML file, then environment, then command-line flags.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration. File: ~/.config/vault/client.toml.
/// Env overrides: VAULT_SERVER, VAULT_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// `host:port` of the vault server.
    #[serde(default = "default_server")]
    pub server: String,
    /// Name to register under. Required before a transfer.
    #[serde(default)]
    pub name: Option<String>,
    /// Where the peer ID and private key are kept between runs.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Resends after a checksum mismatch before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

fn default_server() -> String {
    "127.0.0.1:1357".to_string()
}
fn default_max_packet_size() -> usize {
    vault_core::DEFAULT_MAX_PACKET_SIZE
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_response_timeout_secs() -> u64 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            name: None,
            identity_path: None,
            max_packet_size: default_max_packet_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

impl ClientConfig {
    /// Identity file location; falls back to ~/.config/vault/identity.toml, then the working directory.
    pub fn identity_path(&self) -> PathBuf {
        if let Some(p) = &self.identity_path {
            return p.clone();
        }
        match std::env::var_os("HOME") {
            Some(h) => PathBuf::from(h).join(".config/vault/identity.toml"),
            None => PathBuf::from("vault-identity.toml"),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Wait before resend number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_size == 0 {
            return Err(ConfigError::Invalid("max_packet_size must be non-zero"));
        }
        if self.connect_timeout_secs == 0 || self.response_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero"));
        }
        Ok(())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("VAULT_SERVER") {
            self.server = s.trim().to_string();
        }
        if let Some(s) = lookup("VAULT_NAME") {
            self.name = Some(s);
        }
    }
}

/// Load config from the explicit file or the default path if present, then apply env vars.
pub fn load(explicit: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_from(path)?,
        None => match config_path().filter(|p| p.exists()) {
            Some(path) => load_from(&path)?,
            None => ClientConfig::default(),
        },
    };
    c.apply_env_from(|k| std::env::var(k).ok());
    Ok(c)
}

pub fn load_from(path: &Path) -> Result<ClientConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<ClientConfig>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/vault/client.toml"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
