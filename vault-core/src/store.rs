//! Peer and file metadata. The session consults a [`PeerStore`]; hosts choose the backing.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PublicKey};
use crate::protocol::MAX_NAME_LEN;

/// A registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    pub name: String,
    pub created_at: u64,
    /// Recorded at key exchange; required for reconnect.
    #[serde(default)]
    pub public_key: Option<PublicKey>,
    pub last_seen: u64,
}

/// A file received from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub peer_id: PeerId,
    pub filename: String,
    pub path: String,
    pub original_size: u32,
    pub checksum: u32,
    pub verified: bool,
    pub stored_at: u64,
}

/// Metadata store used by sessions and the server.
pub trait PeerStore: Send + Sync {
    /// Create an identity with a fresh peer ID. Names are unique.
    fn register(&self, name: &str) -> Result<PeerIdentity, StoreError>;
    fn lookup(&self, peer_id: &PeerId) -> Option<PeerIdentity>;
    fn record_public_key(&self, peer_id: &PeerId, key: &PublicKey) -> Result<(), StoreError>;
    /// Update `last_seen`.
    fn touch(&self, peer_id: &PeerId) -> Result<(), StoreError>;
    /// Insert or replace the record for (`peer_id`, `filename`).
    fn record_file(&self, record: FileRecord) -> Result<(), StoreError>;
    fn mark_verified(&self, peer_id: &PeerId, filename: &str) -> Result<(), StoreError>;
    fn remove_file(&self, peer_id: &PeerId, filename: &str) -> Result<(), StoreError>;
    fn files(&self, peer_id: &PeerId) -> Vec<FileRecord>;
}

/// Serializable store contents. Shared by every `PeerStore` backing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub peers: Vec<PeerIdentity>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

impl StoreData {
    pub fn register(&mut self, name: &str) -> Result<PeerIdentity, StoreError> {
        validate_name(name)?;
        if self.peers.iter().any(|p| p.name == name) {
            return Err(StoreError::NameTaken(name.to_string()));
        }
        let mut peer_id = PeerId::generate();
        while peer_id.is_unassigned() || self.find(&peer_id).is_some() {
            peer_id = PeerId::generate();
        }
        let now = unix_now();
        let identity = PeerIdentity {
            peer_id,
            name: name.to_string(),
            created_at: now,
            public_key: None,
            last_seen: now,
        };
        self.peers.push(identity.clone());
        Ok(identity)
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.find(peer_id).cloned()
    }

    pub fn record_public_key(&mut self, peer_id: &PeerId, key: &PublicKey) -> Result<(), StoreError> {
        let peer = self.find_mut(peer_id)?;
        peer.public_key = Some(key.clone());
        peer.last_seen = unix_now();
        Ok(())
    }

    pub fn touch(&mut self, peer_id: &PeerId) -> Result<(), StoreError> {
        self.find_mut(peer_id)?.last_seen = unix_now();
        Ok(())
    }

    pub fn record_file(&mut self, record: FileRecord) -> Result<(), StoreError> {
        if self.find(&record.peer_id).is_none() {
            return Err(StoreError::UnknownPeer(record.peer_id));
        }
        match self
            .files
            .iter()
            .position(|f| f.peer_id == record.peer_id && f.filename == record.filename)
        {
            Some(i) => self.files[i] = record,
            None => self.files.push(record),
        }
        Ok(())
    }

    pub fn mark_verified(&mut self, peer_id: &PeerId, filename: &str) -> Result<(), StoreError> {
        let file = self
            .files
            .iter_mut()
            .find(|f| f.peer_id == *peer_id && f.filename == filename)
            .ok_or_else(|| StoreError::UnknownFile(filename.to_string()))?;
        file.verified = true;
        Ok(())
    }

    pub fn remove_file(&mut self, peer_id: &PeerId, filename: &str) -> Result<(), StoreError> {
        let before = self.files.len();
        self.files
            .retain(|f| !(f.peer_id == *peer_id && f.filename == filename));
        if self.files.len() == before {
            return Err(StoreError::UnknownFile(filename.to_string()));
        }
        Ok(())
    }

    pub fn files(&self, peer_id: &PeerId) -> Vec<FileRecord> {
        self.files
            .iter()
            .filter(|f| f.peer_id == *peer_id)
            .cloned()
            .collect()
    }

    fn find(&self, peer_id: &PeerId) -> Option<&PeerIdentity> {
        self.peers.iter().find(|p| p.peer_id == *peer_id)
    }

    fn find_mut(&mut self, peer_id: &PeerId) -> Result<&mut PeerIdentity, StoreError> {
        self.peers
            .iter_mut()
            .find(|p| p.peer_id == *peer_id)
            .ok_or(StoreError::UnknownPeer(*peer_id))
    }
}

/// Non-empty, at most [`MAX_NAME_LEN`] bytes, no NUL.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\0') {
        return Err(StoreError::InvalidName);
    }
    Ok(())
}

/// In-memory store. Used by tests and by hosts that do not persist.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreData {
        self.with(|d| d.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut StoreData) -> T) -> T {
        let mut guard = match self.data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut *guard)
    }
}

impl PeerStore for MemoryStore {
    fn register(&self, name: &str) -> Result<PeerIdentity, StoreError> {
        self.with(|d| d.register(name))
    }

    fn lookup(&self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.with(|d| d.lookup(peer_id))
    }

    fn record_public_key(&self, peer_id: &PeerId, key: &PublicKey) -> Result<(), StoreError> {
        self.with(|d| d.record_public_key(peer_id, key))
    }

    fn touch(&self, peer_id: &PeerId) -> Result<(), StoreError> {
        self.with(|d| d.touch(peer_id))
    }

    fn record_file(&self, record: FileRecord) -> Result<(), StoreError> {
        self.with(|d| d.record_file(record))
    }

    fn mark_verified(&self, peer_id: &PeerId, filename: &str) -> Result<(), StoreError> {
        self.with(|d| d.mark_verified(peer_id, filename))
    }

    fn remove_file(&self, peer_id: &PeerId, filename: &str) -> Result<(), StoreError> {
        self.with(|d| d.remove_file(peer_id, filename))
    }

    fn files(&self, peer_id: &PeerId) -> Vec<FileRecord> {
        self.with(|d| d.files(peer_id))
    }
}

/// Seconds since the Unix epoch; 0 if the clock is before it.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid name")]
    InvalidName,
    #[error("name already registered: {0}")]
    NameTaken(String),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("unknown file {0}")]
    UnknownFile(String),
    #[error("persistence failed: {0}")]
    Persist(String),
}
