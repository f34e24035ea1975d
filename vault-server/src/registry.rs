//! Live sessions by peer ID. At most one connection per peer; a newer one replaces the older.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use vault_core::PeerId;

/// One live connection for a peer.
#[derive(Debug)]
pub struct SessionEntry {
    pub connection_id: u64,
    pub addr: SocketAddr,
    disconnect: oneshot::Sender<()>,
}

/// Shared registry handed to every connection task.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<PeerId, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `peer_id`. A previous connection for the same peer is told to
    /// disconnect. The returned receiver fires when this connection should close.
    pub async fn insert(
        &self,
        peer_id: PeerId,
        connection_id: u64,
        addr: SocketAddr,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let entry = SessionEntry {
            connection_id,
            addr,
            disconnect: tx,
        };
        let previous = self.inner.lock().await.insert(peer_id, entry);
        if let Some(old) = previous {
            let _ = old.disconnect.send(());
        }
        rx
    }

    /// Remove `peer_id` if it still belongs to `connection_id`.
    pub async fn remove(&self, peer_id: &PeerId, connection_id: u64) -> bool {
        let mut map = self.inner.lock().await;
        match map.get(peer_id) {
            Some(entry) if entry.connection_id == connection_id => {
                map.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    /// Ask the connection for `peer_id` to close. Returns false if the peer is not connected.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        match self.inner.lock().await.remove(peer_id) {
            Some(entry) => {
                let _ = entry.disconnect.send(());
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, peer_id: &PeerId) -> bool {
        self.inner.lock().await.contains_key(peer_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.lock().await.keys().copied().collect()
    }
}
