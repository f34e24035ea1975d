//! Peer identity and key exchange: peer IDs, X25519 keypairs, session keys, key wrapping.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

/// Size of a peer ID on the wire.
pub const PEER_ID_SIZE: usize = 16;
/// Size of an X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Size of the symmetric session key (AES-256).
pub const SESSION_KEY_SIZE: usize = 32;
/// Wrapped session key: ephemeral public key + sealed key + Poly1305 tag.
pub const WRAPPED_KEY_SIZE: usize = PUBLIC_KEY_SIZE + SESSION_KEY_SIZE + 16;

const WRAP_CONTEXT: &[u8] = b"vault-keywrap-v4";

/// Peer ID: 16 opaque bytes assigned by the server at registration.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Carried in request headers before the server has assigned an ID.
    pub const UNASSIGNED: PeerId = PeerId([0u8; PEER_ID_SIZE]);

    /// Fresh random ID (UUID v4 bytes).
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        PeerId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; PEER_ID_SIZE] = bytes.try_into().ok()?;
        Some(PeerId(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    pub fn is_unassigned(&self) -> bool {
        self.0 == [0u8; PEER_ID_SIZE]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(uuid::Uuid::parse_str(s)?.into_bytes()))
    }
}

// Human-readable stores (JSON, TOML) see the hyphenated form.
impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        uuid::Uuid::from_bytes(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(PeerId(uuid::Uuid::deserialize(d)?.into_bytes()))
    }
}

/// Peer public key (32 bytes, X25519).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; PUBLIC_KEY_SIZE]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        PublicKey(bytes)
    }

    /// Parse a key received off the wire. Rejects wrong lengths and the all-zero key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyExchangeError> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| KeyExchangeError::MalformedPublicKey)?;
        if arr == [0u8; PUBLIC_KEY_SIZE] {
            return Err(KeyExchangeError::MalformedPublicKey);
        }
        Ok(PublicKey(arr))
    }
}

/// Symmetric session key. Lives in memory for one session only.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// X25519 keypair held by the initiating peer. The secret never goes on the wire.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore a keypair persisted with [`Keypair::secret_bytes`].
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Recover a session key wrapped for this keypair with [`wrap_session_key`].
    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey, KeyExchangeError> {
        if wrapped.len() != WRAPPED_KEY_SIZE {
            return Err(KeyExchangeError::MalformedWrappedKey);
        }
        let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
        ephemeral.copy_from_slice(&wrapped[..PUBLIC_KEY_SIZE]);
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(ephemeral));
        if !shared.was_contributory() {
            return Err(KeyExchangeError::MalformedWrappedKey);
        }
        let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral, self.public.as_bytes());
        let plain = open(&wrap_key, &wrapped[PUBLIC_KEY_SIZE..])?;
        let key: [u8; SESSION_KEY_SIZE] = plain
            .as_slice()
            .try_into()
            .map_err(|_| KeyExchangeError::Unwrap)?;
        Ok(SessionKey(key))
    }
}

/// Wrap a session key for `recipient`: ephemeral X25519 agreement, SHA-256 key derivation,
/// ChaCha20-Poly1305 seal. Output is `ephemeral_public | sealed_key`.
pub fn wrap_session_key(
    session_key: &SessionKey,
    recipient: &PublicKey,
) -> Result<Vec<u8>, KeyExchangeError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(KeyExchangeError::MalformedPublicKey);
    }
    let wrap_key = derive_wrap_key(shared.as_bytes(), &ephemeral_public, recipient.as_bytes());
    let sealed = seal(&wrap_key, session_key.as_bytes())?;
    let mut out = Vec::with_capacity(WRAPPED_KEY_SIZE);
    out.extend_from_slice(&ephemeral_public);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn derive_wrap_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(WRAP_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}

// Each wrap key comes from a fresh ephemeral secret, so a fixed nonce is never reused.
fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, KeyExchangeError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| KeyExchangeError::Wrap)?;
    let nonce = chacha20poly1305::Nonce::default();
    cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| KeyExchangeError::Wrap)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, KeyExchangeError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| KeyExchangeError::Unwrap)?;
    let nonce = chacha20poly1305::Nonce::default();
    cipher
        .decrypt(&nonce, sealed)
        .map_err(|_| KeyExchangeError::Unwrap)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyExchangeError {
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("malformed wrapped session key")]
    MalformedWrappedKey,
    #[error("session key wrap failed")]
    Wrap,
    #[error("session key unwrap failed")]
    Unwrap,
    /// The other side answered the key exchange with an error status.
    #[error("key exchange refused by peer")]
    Refused,
}
