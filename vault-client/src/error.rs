use std::path::PathBuf;

use vault_core::{ChunkError, ErrorCode, KeyExchangeError, WireError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection: {0}")]
    Connection(String),
    #[error("key exchange: {0}")]
    KeyExchange(#[from] KeyExchangeError),
    #[error("server rejected the transfer as oversized")]
    TransferOverflow,
    #[error("checksum mismatch after {attempts} attempt(s)")]
    ChecksumFailed { attempts: u32 },
    #[error("name {0:?} refused by server")]
    RegistrationRefused(String),
    #[error("server rejected request: {0:?}")]
    Rejected(ErrorCode),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("file: {0}")]
    File(#[from] ChunkError),
    #[error("identity file {path}: {reason}")]
    Identity { path: PathBuf, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Map an error status from the server to the matching client error. A checksum
    /// failure carries no attempt count here; the driver fills it in.
    pub fn from_rejection(code: ErrorCode) -> Self {
        match code {
            ErrorCode::TransferOverflow => ClientError::TransferOverflow,
            ErrorCode::KeyExchangeFailed => ClientError::KeyExchange(KeyExchangeError::Refused),
            ErrorCode::ChecksumFailed => ClientError::ChecksumFailed { attempts: 0 },
            ErrorCode::ProtocolViolation => {
                ClientError::ProtocolViolation("server reported a protocol violation".into())
            }
            other => ClientError::Rejected(other),
        }
    }
}
