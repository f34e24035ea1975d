//! Accept loop: binds the listener and spawns one connection task per client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use vault_core::{PeerStore, RequestHeader, Session, SessionOutput};

use crate::config::ServerConfig;
use crate::connection::accept_connection;
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::storage::{FileStorage, JsonPeerStore};

/// State shared by every connection task.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) store: Arc<dyn PeerStore>,
    pub(crate) storage: FileStorage,
    pub(crate) registry: SessionRegistry,
}

/// Server before it starts listening.
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Open file storage and the JSON metadata store named by `config`.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = JsonPeerStore::open(config.metadata_path())?;
        Self::with_store(config, Arc::new(store))
    }

    /// Use a caller-supplied metadata store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn PeerStore>) -> Result<Self, ServerError> {
        config.validate()?;
        let storage = FileStorage::new(&config.storage_dir)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                storage,
                registry: SessionRegistry::new(),
            }),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    /// Bind `config.bind` and start accepting.
    pub async fn start(self) -> Result<DispatcherHandle, ServerError> {
        let listener = TcpListener::bind(self.shared.config.bind).await?;
        self.serve(listener)
    }

    /// Start accepting on an already bound listener.
    pub fn serve(self, listener: TcpListener) -> Result<DispatcherHandle, ServerError> {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = self.shared.registry.clone();
        info!(event = "listening", addr = %local_addr);
        let task = tokio::spawn(accept_loop(listener, self.shared, shutdown_rx));
        Ok(DispatcherHandle {
            local_addr,
            registry,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Bind and start with `config`, using the JSON metadata store.
pub async fn start(config: ServerConfig) -> Result<DispatcherHandle, ServerError> {
    Dispatcher::new(config)?.start().await
}

/// Running server.
pub struct DispatcherHandle {
    local_addr: SocketAddr,
    registry: SessionRegistry,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Stop accepting, close every connection and wait for their tasks to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(event = "accept_loop_panicked", error = %e);
        }
        info!(event = "stopped", addr = %self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    next_id += 1;
                    tasks.spawn(accept_connection(
                        stream,
                        addr,
                        next_id,
                        shared.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(event = "accept_failed", error = %e),
            },
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = res {
                    warn!(event = "connection_panicked", error = %e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);
    debug!(event = "draining", connections = tasks.len());
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(event = "connection_panicked", error = %e);
        }
    }
}

/// Hand one decoded frame to the session.
pub fn route(
    session: &mut Session,
    header: &RequestHeader,
    payload: &[u8],
    store: &dyn PeerStore,
) -> SessionOutput {
    let before = session.state();
    let output = session.handle(header, payload, store);
    if session.state() != before {
        debug!(
            event = "state_change",
            peer = ?session.peer_id(),
            opcode = header.opcode,
            from = ?before,
            to = ?session.state()
        );
    }
    output
}
