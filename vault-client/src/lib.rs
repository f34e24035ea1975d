//! Vault client: registers with a vault server (or resumes a saved identity) and uploads
//! files encrypted under the session key, confirming the server's checksum.

pub mod config;
pub mod driver;
pub mod error;
pub mod identity;

pub use config::ClientConfig;
pub use driver::{submit, Driver, TransferReport};
pub use error::ClientError;
