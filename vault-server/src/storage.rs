//! On-disk persistence: received files and the JSON metadata store.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use vault_core::{FileRecord, PeerId, PeerIdentity, PeerStore, PublicKey, StoreData, StoreError};

/// Received files, one directory per peer.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `filename` from `peer_id` is stored. `None` if nothing usable remains after
    /// sanitizing.
    pub fn path_for(&self, peer_id: &PeerId, filename: &str) -> Option<PathBuf> {
        let name = sanitize_filename(filename)?;
        Some(self.root.join(peer_id.to_string()).join(name))
    }

    /// Write atomically (temp file + rename), replacing an earlier copy.
    pub fn write(&self, peer_id: &PeerId, filename: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.path_for(peer_id, filename).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unusable filename")
        })?;
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(
            ".{}.part",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("upload")
        ));
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Delete a stored file. Missing files are not an error.
    pub fn remove(&self, peer_id: &PeerId, filename: &str) -> std::io::Result<()> {
        let Some(path) = self.path_for(peer_id, filename) else {
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Keep only the final path component; replace control characters. Rejects `.`/`..`/empty.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    Some(cleaned)
}

/// `PeerStore` persisted as a JSON document. Every mutation is written through; a failed write
/// leaves the in-memory state as it was.
#[derive(Debug)]
pub struct JsonPeerStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonPeerStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Persist(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(StoreError::Persist(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> T {
        let guard = match self.data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&*guard)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = match self.data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = guard.clone();
        let out = f(&mut *guard)?;
        if let Err(e) = self.persist(&*guard) {
            *guard = before;
            return Err(e);
        }
        Ok(out)
    }

    fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(data).map_err(|e| self.persist_error(e))?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| self.persist_error(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|e| self.persist_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.persist_error(e))
    }

    fn persist_error(&self, e: impl std::fmt::Display) -> StoreError {
        StoreError::Persist(format!("{}: {e}", self.path.display()))
    }
}

impl PeerStore for JsonPeerStore {
    fn register(&self, name: &str) -> Result<PeerIdentity, StoreError> {
        self.write(|d| d.register(name))
    }

    fn lookup(&self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.read(|d| d.lookup(peer_id))
    }

    fn record_public_key(&self, peer_id: &PeerId, key: &PublicKey) -> Result<(), StoreError> {
        self.write(|d| d.record_public_key(peer_id, key))
    }

    fn touch(&self, peer_id: &PeerId) -> Result<(), StoreError> {
        self.write(|d| d.touch(peer_id))
    }

    fn record_file(&self, record: FileRecord) -> Result<(), StoreError> {
        self.write(|d| d.record_file(record))
    }

    fn mark_verified(&self, peer_id: &PeerId, filename: &str) -> Result<(), StoreError> {
        self.write(|d| d.mark_verified(peer_id, filename))
    }

    fn remove_file(&self, peer_id: &PeerId, filename: &str) -> Result<(), StoreError> {
        self.write(|d| d.remove_file(peer_id, filename))
    }

    fn files(&self, peer_id: &PeerId) -> Vec<FileRecord> {
        self.read(|d| d.files(peer_id))
    }
}
