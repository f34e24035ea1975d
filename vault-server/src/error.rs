use vault_core::{StoreError, WireError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("metadata store: {0}")]
    Store(#[from] StoreError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}
