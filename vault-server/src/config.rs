//! Load config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vault_core::identity::PUBLIC_KEY_SIZE;
use vault_core::protocol::{NAME_FIELD_SIZE, PACKET_META_SIZE};
use vault_core::wire::MAX_PAYLOAD_SIZE;
use vault_core::SessionConfig;

/// Server configuration. File: ~/.config/vault/server.toml or /etc/vault/server.toml.
/// Env overrides: VAULT_BIND, VAULT_STORAGE_DIR, VAULT_IDLE_TIMEOUT, VAULT_MAX_PACKET_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address (default 0.0.0.0:1357).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Received files land under `<storage_dir>/<peer_id>/`.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Peer/file metadata (JSON). Defaults to `<storage_dir>/peers.json`.
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// Largest ciphertext slice per packet (default 64 KiB).
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_max_total_packets")]
    pub max_total_packets: u16,
    /// Seconds without a complete request before the connection is dropped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_checksum_retries")]
    pub max_checksum_retries: u32,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1357))
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/vault")
}
fn default_max_packet_size() -> usize {
    vault_core::DEFAULT_MAX_PACKET_SIZE
}
fn default_max_total_packets() -> u16 {
    u16::MAX
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_checksum_retries() -> u32 {
    vault_core::session::DEFAULT_MAX_CHECKSUM_RETRIES
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            storage_dir: default_storage_dir(),
            metadata_path: None,
            max_packet_size: default_max_packet_size(),
            max_total_packets: default_max_total_packets(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_checksum_retries: default_max_checksum_retries(),
        }
    }
}

impl ServerConfig {
    pub fn metadata_path(&self) -> PathBuf {
        self.metadata_path
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("peers.json"))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_packet_size: self.max_packet_size,
            max_total_packets: self.max_total_packets,
            max_checksum_retries: self.max_checksum_retries,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Largest payload a well-formed request can carry under this config.
    pub fn max_payload_size(&self) -> usize {
        let packet = PACKET_META_SIZE.saturating_add(self.max_packet_size);
        packet
            .max(NAME_FIELD_SIZE + PUBLIC_KEY_SIZE)
            .min(MAX_PAYLOAD_SIZE as usize)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_size == 0 {
            return Err(ConfigError::Invalid("max_packet_size must be non-zero"));
        }
        if PACKET_META_SIZE + self.max_packet_size > MAX_PAYLOAD_SIZE as usize {
            return Err(ConfigError::Invalid("max_packet_size exceeds the 16 MiB payload cap"));
        }
        if self.max_total_packets == 0 {
            return Err(ConfigError::Invalid("max_total_packets must be non-zero"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be non-zero"));
        }
        Ok(())
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(s) = lookup("VAULT_BIND") {
            self.bind = parse_env("VAULT_BIND", &s)?;
        }
        if let Some(s) = lookup("VAULT_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(s);
        }
        if let Some(s) = lookup("VAULT_IDLE_TIMEOUT") {
            self.idle_timeout_secs = parse_env("VAULT_IDLE_TIMEOUT", &s)?;
        }
        if let Some(s) = lookup("VAULT_MAX_PACKET_SIZE") {
            self.max_packet_size = parse_env("VAULT_MAX_PACKET_SIZE", &s)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

/// Load config: defaults, then the explicit file or the first existing search path, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_from(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_from(&path)?,
            None => ServerConfig::default(),
        },
    };
    c.apply_env_from(|k| std::env::var(k).ok())?;
    c.validate()?;
    Ok(c)
}

pub fn load_from(path: &Path) -> Result<ServerConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<ServerConfig>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/vault/server.toml"));
    }
    out.push(PathBuf::from("/etc/vault/server.toml"));
    out
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
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
