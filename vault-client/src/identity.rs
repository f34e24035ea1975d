//! Persisted client identity: registered name, peer ID and the private key used for reconnects.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use vault_core::{Keypair, PeerId};

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFile {
    pub name: String,
    pub peer_id: PeerId,
    /// X25519 private key, hex.
    pub secret_key: String,
}

impl IdentityFile {
    pub fn new(name: &str, peer_id: PeerId, keypair: &Keypair) -> Self {
        Self {
            name: name.to_string(),
            peer_id,
            secret_key: hex::encode(keypair.secret_bytes()),
        }
    }

    pub fn keypair(&self) -> Result<Keypair, String> {
        let bytes = hex::decode(self.secret_key.trim()).map_err(|e| e.to_string())?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "secret_key must be 32 bytes".to_string())?;
        Ok(Keypair::from_secret_bytes(secret))
    }
}

/// Read the identity file. A missing file is `Ok(None)`.
pub fn load(path: &Path) -> Result<Option<IdentityFile>, ClientError> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(identity_error(path, e)),
    };
    let id: IdentityFile = toml::from_str(&s).map_err(|e| identity_error(path, e))?;
    id.keypair().map_err(|e| identity_error(path, e))?;
    Ok(Some(id))
}

/// Write the identity file (owner-only permissions on Unix).
pub fn save(path: &Path, identity: &IdentityFile) -> Result<(), ClientError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| identity_error(path, e))?;
    }
    let body = toml::to_string(identity).map_err(|e| identity_error(path, e))?;
    let tmp = path.with_extension("toml.tmp");
    // A leftover temp file could carry wider permissions; start fresh.
    match std::fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(identity_error(path, e));
        }
        _ => {}
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp).map_err(|e| identity_error(path, e))?;
    file.write_all(body.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| identity_error(path, e))?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(|e| identity_error(path, e))
}

fn identity_error(path: &Path, e: impl std::fmt::Display) -> ClientError {
    ClientError::Identity {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
