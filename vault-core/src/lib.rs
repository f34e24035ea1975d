//! Vault protocol core: framing, key exchange, file encryption, chunking and the session
//! state machine.
//! Host-driven: no I/O; the host passes request frames and applies the returned effects.

pub mod checksum;
pub mod chunk;
pub mod cipher;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod store;
pub mod wire;

pub use chunk::{
    AcceptOutcome, ChunkError, PacketPlan, Reassembled, TransferState, DEFAULT_MAX_PACKET_SIZE,
};
pub use cipher::{CipherError, StreamDecryptor, StreamEncryptor};
pub use identity::{KeyExchangeError, Keypair, PeerId, PublicKey, SessionKey};
pub use protocol::{ErrorCode, FilePacket, Request, RequestCode, Response, StatusCode, PROTOCOL_VERSION};
pub use session::{Effect, Session, SessionConfig, SessionError, SessionOutput, SessionState};
pub use store::{FileRecord, MemoryStore, PeerIdentity, PeerStore, StoreData, StoreError};
pub use wire::{RequestHeader, ResponseHeader, WireError};
