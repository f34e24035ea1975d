//! Vault storage server: accepts client connections, runs one protocol session per connection,
//! stores received files under the configured directory.

pub mod config;
mod connection;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod storage;

pub use config::ServerConfig;
pub use dispatcher::{start, Dispatcher, DispatcherHandle};
pub use error::ServerError;
pub use registry::SessionRegistry;
pub use storage::{FileStorage, JsonPeerStore};
