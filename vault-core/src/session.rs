//! Host-driven session: the host passes each request frame, the session returns the response,
//! the effects to apply and whether to close.

use crate::checksum::Checksum;
use crate::chunk::{AcceptOutcome, ChunkError, Reassembled, TransferState, DEFAULT_MAX_PACKET_SIZE};
use crate::cipher::{CipherError, StreamDecryptor};
use crate::identity::{self, KeyExchangeError, PeerId, PublicKey, SessionKey};
use crate::protocol::{ErrorCode, FilePacket, Request, Response};
use crate::store::{validate_name, PeerStore, StoreError};
use crate::wire::{RequestHeader, WireError};

/// Default number of ChecksumRetry verdicts accepted per file.
pub const DEFAULT_MAX_CHECKSUM_RETRIES: u32 = 3;

/// Per-session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub max_packet_size: usize,
    pub max_total_packets: u16,
    pub max_checksum_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_total_packets: u16::MAX,
            max_checksum_retries: DEFAULT_MAX_CHECKSUM_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unregistered,
    Registered,
    KeyExchanged,
    Transferring,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// Side effect for the host to carry out before sending the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Persist a fully received, decrypted file (replaces any earlier copy).
    StoreFile {
        peer_id: PeerId,
        filename: String,
        contents: Vec<u8>,
        checksum: u32,
    },
    /// The client confirmed the checksum.
    FileVerified { peer_id: PeerId, filename: String },
    /// Drop a stored file the client gave up on.
    DiscardFile { peer_id: PeerId, filename: String },
}

/// Result of one `handle` call.
#[derive(Debug, Default)]
pub struct SessionOutput {
    pub response: Option<Response>,
    pub effects: Vec<Effect>,
    /// Host must close the connection after writing `response`.
    pub close: bool,
    /// The error behind an error response, for the host's logs.
    pub error: Option<SessionError>,
}

impl SessionOutput {
    fn respond(response: Response) -> Self {
        Self {
            response: Some(response),
            ..Self::default()
        }
    }

    fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

enum Phase {
    Receiving(TransferState),
    /// Reassembled and reported. `total_packets` lets late duplicates be recognized.
    AwaitingVerdict { checksum: u32, total_packets: u16 },
    /// After a retry verdict: the next packet for the same filename starts a fresh transfer.
    AwaitingResend,
}

struct Transfer {
    filename: String,
    retries: u32,
    phase: Phase,
}

/// One client connection's protocol state.
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    peer_id: Option<PeerId>,
    name: Option<String>,
    session_key: Option<SessionKey>,
    transfer: Option<Transfer>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Unregistered,
            peer_id: None,
            name: None,
            session_key: None,
            transfer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }

    /// Filename of the open transfer, if any.
    pub fn transfer_filename(&self) -> Option<&str> {
        self.transfer.as_ref().map(|t| t.filename.as_str())
    }

    /// Checksum reported for the file awaiting a verdict.
    pub fn pending_checksum(&self) -> Option<u32> {
        match self.transfer.as_ref().map(|t| &t.phase) {
            Some(Phase::AwaitingVerdict { checksum, .. }) => Some(*checksum),
            _ => None,
        }
    }

    /// Retry verdicts received for the open transfer.
    pub fn retries(&self) -> u32 {
        self.transfer.as_ref().map_or(0, |t| t.retries)
    }

    /// Handle one request frame. `payload` is exactly `header.payload_size` bytes.
    pub fn handle(
        &mut self,
        header: &RequestHeader,
        payload: &[u8],
        store: &dyn PeerStore,
    ) -> SessionOutput {
        if self.state.is_terminal() {
            return SessionOutput {
                close: true,
                error: Some(SessionError::Terminated),
                ..SessionOutput::default()
            };
        }
        let request = match Request::decode(header, payload) {
            Ok(r) => r,
            Err(WireError::UnknownOpcode(op)) => {
                return self.reject(SessionError::ProtocolViolation(format!("unknown opcode {op}")))
            }
            Err(e) => return self.fail(SessionError::from_wire(e)),
        };
        if let Some(own) = self.peer_id {
            if header.peer_id != own {
                return self.reject(SessionError::ProtocolViolation(format!(
                    "header peer id {} does not match session peer",
                    header.peer_id
                )));
            }
        }
        match (self.state, request) {
            (SessionState::Unregistered, Request::Register { name }) => self.register(&name, store),
            (SessionState::Unregistered, Request::Reconnect { name }) => {
                self.reconnect(header.peer_id, &name, store)
            }
            (SessionState::Registered, Request::SendPublicKey { name, public_key }) => {
                self.accept_public_key(&name, &public_key, store)
            }
            (SessionState::KeyExchanged | SessionState::Transferring, Request::SendFile(packet)) => {
                self.receive_packet(packet)
            }
            (SessionState::Transferring, Request::ChecksumOk { filename }) => {
                self.verdict_ok(&filename)
            }
            (SessionState::Transferring, Request::ChecksumRetry { filename }) => {
                self.verdict_retry(&filename)
            }
            (SessionState::Transferring, Request::ChecksumAbort { filename }) => {
                self.verdict_abort(&filename)
            }
            (state, request) => self.reject(SessionError::ProtocolViolation(format!(
                "{:?} not allowed in state {:?}",
                request.code(),
                state
            ))),
        }
    }

    /// Connection closed by the peer.
    pub fn on_disconnect(&mut self) {
        self.transfer = None;
        self.session_key = None;
        if self.state == SessionState::Transferring {
            self.state = SessionState::Failed;
        } else if !self.state.is_terminal() {
            self.state = SessionState::Completed;
        }
    }

    /// No request arrived within the idle timeout.
    pub fn on_idle_timeout(&mut self) {
        self.transfer = None;
        self.session_key = None;
        self.state = SessionState::Failed;
    }

    /// The host rejected a frame before it reached the session (e.g. an oversized payload).
    pub fn on_frame_error(&mut self, err: WireError) -> SessionOutput {
        self.fail(SessionError::from_wire(err))
    }

    /// The host could not apply an effect. Fails the session with a general error.
    pub fn on_storage_failure(&mut self, err: StoreError) -> SessionOutput {
        self.fail(SessionError::Storage(err))
    }

    fn register(&mut self, name: &str, store: &dyn PeerStore) -> SessionOutput {
        if validate_name(name).is_err() {
            return SessionOutput::respond(Response::RegisterFailed);
        }
        match store.register(name) {
            Ok(identity) => {
                self.peer_id = Some(identity.peer_id);
                self.name = Some(identity.name);
                self.state = SessionState::Registered;
                SessionOutput::respond(Response::RegisterOk {
                    peer_id: identity.peer_id,
                })
            }
            Err(StoreError::NameTaken(_)) | Err(StoreError::InvalidName) => {
                SessionOutput::respond(Response::RegisterFailed)
            }
            Err(e) => self.fail(SessionError::Storage(e)),
        }
    }

    fn reconnect(&mut self, claimed: PeerId, name: &str, store: &dyn PeerStore) -> SessionOutput {
        let known_key = store
            .lookup(&claimed)
            .filter(|identity| identity.name == name)
            .and_then(|identity| identity.public_key);
        let Some(public_key) = known_key else {
            return SessionOutput::respond(Response::ReconnectDenied { peer_id: claimed });
        };
        let session_key = SessionKey::generate();
        let wrapped_key = match identity::wrap_session_key(&session_key, &public_key) {
            Ok(w) => w,
            Err(e) => return self.fail(SessionError::KeyExchange(e)),
        };
        if let Err(e) = store.touch(&claimed) {
            return self.fail(SessionError::Storage(e));
        }
        self.peer_id = Some(claimed);
        self.name = Some(name.to_string());
        self.session_key = Some(session_key);
        self.state = SessionState::KeyExchanged;
        SessionOutput::respond(Response::ReconnectOk {
            peer_id: claimed,
            wrapped_key,
        })
    }

    fn accept_public_key(
        &mut self,
        name: &str,
        raw_key: &[u8],
        store: &dyn PeerStore,
    ) -> SessionOutput {
        if self.name.as_deref() != Some(name) {
            return self.reject(SessionError::ProtocolViolation(
                "public key sent under a different name".into(),
            ));
        }
        let Some(peer_id) = self.peer_id else {
            return self.fail(SessionError::ProtocolViolation("registered without peer id".into()));
        };
        let public_key = match PublicKey::from_slice(raw_key) {
            Ok(k) => k,
            Err(e) => return self.fail(SessionError::KeyExchange(e)),
        };
        let session_key = SessionKey::generate();
        let wrapped_key = match identity::wrap_session_key(&session_key, &public_key) {
            Ok(w) => w,
            Err(e) => return self.fail(SessionError::KeyExchange(e)),
        };
        if let Err(e) = store.record_public_key(&peer_id, &public_key) {
            return self.fail(SessionError::Storage(e));
        }
        self.session_key = Some(session_key);
        self.state = SessionState::KeyExchanged;
        SessionOutput::respond(Response::KeyAccepted {
            peer_id,
            wrapped_key,
        })
    }

    fn receive_packet(&mut self, packet: FilePacket) -> SessionOutput {
        let config = self.config;
        if self.transfer.is_none() {
            let state = match TransferState::open(
                &packet,
                config.max_packet_size,
                config.max_total_packets,
            ) {
                Ok(s) => s,
                Err(e) => return self.fail(SessionError::from_chunk(e)),
            };
            self.state = SessionState::Transferring;
            self.transfer = Some(Transfer {
                filename: packet.filename.clone(),
                retries: 0,
                phase: Phase::Receiving(state),
            });
        }
        let Some(transfer) = self.transfer.as_mut() else {
            return self.fail(SessionError::ProtocolViolation("transfer vanished".into()));
        };
        if packet.filename != transfer.filename {
            let err = SessionError::ProtocolViolation(format!(
                "packet for {:?} while {:?} is open",
                packet.filename, transfer.filename
            ));
            return self.reject(err);
        }
        if let Phase::AwaitingResend = transfer.phase {
            match TransferState::open(&packet, config.max_packet_size, config.max_total_packets) {
                Ok(s) => transfer.phase = Phase::Receiving(s),
                Err(e) => return self.fail(SessionError::from_chunk(e)),
            }
        }
        if let Phase::AwaitingVerdict { total_packets, .. } = transfer.phase {
            // A repeat of a packet that completed the file: absorbed like any duplicate.
            if (1..=total_packets).contains(&packet.packet_number)
                && packet.total_packets == total_packets
            {
                return SessionOutput::default();
            }
        }
        let Phase::Receiving(state) = &mut transfer.phase else {
            return self.reject(SessionError::ProtocolViolation(
                "packet received while awaiting checksum verdict".into(),
            ));
        };
        let original_size = state.original_size();
        let total_packets = state.total_packets();
        match state.accept(packet) {
            Ok(AcceptOutcome::InProgress) | Ok(AcceptOutcome::DuplicateIgnored) => {
                SessionOutput::default()
            }
            Ok(AcceptOutcome::Complete(file)) => {
                self.complete_transfer(file, original_size, total_packets)
            }
            Err(e) => self.fail(SessionError::from_chunk(e)),
        }
    }

    /// Decrypt and checksum the file chunk by chunk, releasing each ciphertext chunk as it
    /// is consumed.
    fn complete_transfer(
        &mut self,
        file: Reassembled,
        original_size: u32,
        total_packets: u16,
    ) -> SessionOutput {
        let (Some(peer_id), Some(key)) = (self.peer_id, self.session_key.as_ref()) else {
            return self.fail(SessionError::ProtocolViolation("transfer without session key".into()));
        };
        let content_size = file.len();
        let mut decryptor = StreamDecryptor::new(key);
        let mut checksum = Checksum::new();
        let mut plaintext = Vec::with_capacity(content_size.min(original_size as usize));
        for chunk in file.into_chunks() {
            let plain = decryptor.update(&chunk);
            checksum.update(&plain);
            plaintext.extend_from_slice(&plain);
        }
        let tail = match decryptor.finish() {
            Ok(t) => t,
            Err(e) => return self.fail(SessionError::Decryption(e)),
        };
        checksum.update(&tail);
        plaintext.extend_from_slice(&tail);
        if plaintext.len() != original_size as usize {
            return self.fail(SessionError::SizeMismatch {
                declared: original_size as u64,
                actual: plaintext.len() as u64,
            });
        }
        let sum = checksum.finalize();
        let Some(transfer) = self.transfer.as_mut() else {
            return self.fail(SessionError::ProtocolViolation("transfer vanished".into()));
        };
        transfer.phase = Phase::AwaitingVerdict {
            checksum: sum,
            total_packets,
        };
        let filename = transfer.filename.clone();
        SessionOutput::respond(Response::FileReceived {
            peer_id,
            content_size: content_size as u32,
            filename: filename.clone(),
            checksum: sum,
        })
        .with_effect(Effect::StoreFile {
            peer_id,
            filename,
            contents: plaintext,
            checksum: sum,
        })
    }

    /// Checks the verdict targets the transfer awaiting one. Returns the peer id on success.
    fn check_verdict(&self, filename: &str) -> Result<PeerId, SessionError> {
        let awaiting = self.transfer.as_ref().is_some_and(|t| {
            t.filename == filename && matches!(t.phase, Phase::AwaitingVerdict { .. })
        });
        match (awaiting, self.peer_id) {
            (true, Some(peer_id)) => Ok(peer_id),
            _ => Err(SessionError::ProtocolViolation(format!(
                "no checksum report pending for {filename:?}"
            ))),
        }
    }

    fn verdict_ok(&mut self, filename: &str) -> SessionOutput {
        let peer_id = match self.check_verdict(filename) {
            Ok(p) => p,
            Err(e) => return self.reject(e),
        };
        self.transfer = None;
        self.state = SessionState::KeyExchanged;
        SessionOutput::respond(Response::Ack { peer_id }).with_effect(Effect::FileVerified {
            peer_id,
            filename: filename.to_string(),
        })
    }

    fn verdict_retry(&mut self, filename: &str) -> SessionOutput {
        let peer_id = match self.check_verdict(filename) {
            Ok(p) => p,
            Err(e) => return self.reject(e),
        };
        let max = self.config.max_checksum_retries;
        let Some(transfer) = self.transfer.as_mut() else {
            return self.reject(SessionError::ProtocolViolation("no transfer".into()));
        };
        transfer.retries += 1;
        if transfer.retries > max {
            let retries = transfer.retries;
            return self
                .fail(SessionError::ChecksumFailed { retries })
                .with_effect(Effect::DiscardFile {
                    peer_id,
                    filename: filename.to_string(),
                });
        }
        transfer.phase = Phase::AwaitingResend;
        SessionOutput::respond(Response::Ack { peer_id })
    }

    fn verdict_abort(&mut self, filename: &str) -> SessionOutput {
        let peer_id = match self.check_verdict(filename) {
            Ok(p) => p,
            Err(e) => return self.reject(e),
        };
        self.transfer = None;
        self.session_key = None;
        self.state = SessionState::Failed;
        SessionOutput {
            response: Some(Response::Ack { peer_id }),
            effects: vec![Effect::DiscardFile {
                peer_id,
                filename: filename.to_string(),
            }],
            close: true,
            error: None,
        }
    }

    /// Error response; state unchanged, connection stays open.
    fn reject(&mut self, err: SessionError) -> SessionOutput {
        SessionOutput {
            response: Some(Response::Rejected(err.error_code())),
            effects: Vec::new(),
            close: false,
            error: Some(err),
        }
    }

    /// Error response; session fails and the connection closes.
    fn fail(&mut self, err: SessionError) -> SessionOutput {
        self.transfer = None;
        self.session_key = None;
        self.state = SessionState::Failed;
        SessionOutput {
            response: Some(Response::Rejected(err.error_code())),
            effects: Vec::new(),
            close: true,
            error: Some(err),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("malformed header")]
    MalformedHeader,
    #[error("payload size mismatch: declared {declared}, actual {actual}")]
    PayloadSizeMismatch { declared: u64, actual: u64 },
    #[error("malformed request: {0}")]
    MalformedRequest(WireError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),
    #[error("decryption failed: {0}")]
    Decryption(#[from] CipherError),
    #[error("decrypted size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("transfer overflow: {declared} bytes against capacity {capacity}")]
    TransferOverflow { declared: u64, capacity: u64 },
    #[error("invalid packet: {0}")]
    InvalidPacket(ChunkError),
    #[error("checksum failed after {retries} retries")]
    ChecksumFailed { retries: u32 },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("session terminated")]
    Terminated,
}

impl SessionError {
    fn from_wire(e: WireError) -> Self {
        match e {
            WireError::MalformedHeader => SessionError::MalformedHeader,
            WireError::PayloadSizeMismatch { declared, actual } => {
                SessionError::PayloadSizeMismatch { declared, actual }
            }
            other => SessionError::MalformedRequest(other),
        }
    }

    fn from_chunk(e: ChunkError) -> Self {
        match e {
            ChunkError::TransferOverflow { declared, capacity } => {
                SessionError::TransferOverflow { declared, capacity }
            }
            ChunkError::SizeMismatch { declared, actual } => {
                SessionError::PayloadSizeMismatch { declared, actual }
            }
            other => SessionError::InvalidPacket(other),
        }
    }

    /// Status code sent for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SessionError::MalformedHeader
            | SessionError::PayloadSizeMismatch { .. }
            | SessionError::MalformedRequest(_)
            | SessionError::InvalidPacket(_) => ErrorCode::MalformedRequest,
            SessionError::ProtocolViolation(_) | SessionError::Terminated => {
                ErrorCode::ProtocolViolation
            }
            SessionError::KeyExchange(_) => ErrorCode::KeyExchangeFailed,
            SessionError::Decryption(_) | SessionError::SizeMismatch { .. } => {
                ErrorCode::DecryptionFailed
            }
            SessionError::TransferOverflow { .. } => ErrorCode::TransferOverflow,
            SessionError::ChecksumFailed { .. } => ErrorCode::ChecksumFailed,
            SessionError::Connection(_) | SessionError::Storage(_) => ErrorCode::GeneralError,
        }
    }

    /// Whether the session fails on this error. Only protocol violations are survivable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::ProtocolViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::split;
    use crate::{checksum, cipher};
    use crate::identity::Keypair;
    use crate::protocol::RequestCode;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    /// Client-side view for driving a session in tests.
    struct Peer {
        id: PeerId,
        keypair: Keypair,
        key: Option<SessionKey>,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                id: PeerId::UNASSIGNED,
                keypair: Keypair::generate(),
                key: None,
            }
        }

        fn send(&self, session: &mut Session, store: &MemoryStore, req: Request) -> SessionOutput {
            let payload = req.encode_payload().unwrap();
            let header = RequestHeader::new(self.id, req.code() as u16, payload.len() as u32);
            session.handle(&header, &payload, store)
        }

        fn register(&mut self, session: &mut Session, store: &MemoryStore, name: &str) {
            let out = self.send(session, store, Request::Register { name: name.into() });
            match out.response {
                Some(Response::RegisterOk { peer_id }) => self.id = peer_id,
                other => panic!("expected RegisterOk, got {other:?}"),
            }
        }

        fn exchange(&mut self, session: &mut Session, store: &MemoryStore, name: &str) {
            let out = self.send(
                session,
                store,
                Request::SendPublicKey {
                    name: name.into(),
                    public_key: self.keypair.public_key().as_bytes().to_vec(),
                },
            );
            match out.response {
                Some(Response::KeyAccepted { wrapped_key, .. }) => {
                    self.key = Some(self.keypair.unwrap_session_key(&wrapped_key).unwrap());
                }
                other => panic!("expected KeyAccepted, got {other:?}"),
            }
        }

        fn packets(&self, data: &[u8], max: usize, filename: &str) -> Vec<FilePacket> {
            let ct = cipher::encrypt(self.key.as_ref().unwrap(), data);
            split(&ct, max, filename, data.len() as u64).unwrap()
        }
    }

    fn ready(store: &MemoryStore, config: SessionConfig) -> (Session, Peer) {
        let mut session = Session::new(config);
        let mut peer = Peer::new();
        peer.register(&mut session, store, "alice");
        peer.exchange(&mut session, store, "alice");
        (session, peer)
    }

    fn small_packets() -> SessionConfig {
        SessionConfig {
            max_packet_size: 32,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn register_alice() {
        let store = MemoryStore::new();
        let mut session = Session::new(SessionConfig::default());
        let out = Peer::new().send(&mut session, &store, Request::Register { name: "alice".into() });
        let Some(Response::RegisterOk { peer_id }) = out.response else {
            panic!("expected RegisterOk");
        };
        let frame = Response::RegisterOk { peer_id }.to_frame().unwrap();
        assert_eq!(frame.len(), 7 + 16);
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(session.peer_id(), Some(peer_id));
        assert!(!out.close);
    }

    #[test]
    fn duplicate_name_fails_without_state_change() {
        let store = MemoryStore::new();
        store.register("alice").unwrap();
        let mut session = Session::new(SessionConfig::default());
        let out = Peer::new().send(&mut session, &store, Request::Register { name: "alice".into() });
        assert_eq!(out.response, Some(Response::RegisterFailed));
        assert_eq!(session.state(), SessionState::Unregistered);

        let out = Peer::new().send(&mut session, &store, Request::Register { name: "".into() });
        assert_eq!(out.response, Some(Response::RegisterFailed));
        assert_eq!(session.state(), SessionState::Unregistered);
    }

    #[test]
    fn send_file_before_public_key_is_violation() {
        let store = MemoryStore::new();
        let mut session = Session::new(SessionConfig::default());
        let mut peer = Peer::new();
        peer.register(&mut session, &store, "alice");
        let packet = FilePacket {
            content_size: 16,
            original_size: 1,
            packet_number: 1,
            total_packets: 1,
            filename: "a.txt".into(),
            content: vec![0; 16],
        };
        let out = peer.send(&mut session, &store, Request::SendFile(packet));
        assert_eq!(
            out.response,
            Some(Response::Rejected(ErrorCode::ProtocolViolation))
        );
        assert!(!out.close);
        assert_eq!(session.state(), SessionState::Registered);
    }

    #[test]
    fn key_exchange_then_transfer_and_verify() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        assert_eq!(session.state(), SessionState::KeyExchanged);
        assert!(store.lookup(&peer.id).unwrap().public_key.is_some());

        let data = b"the quick brown fox jumps over the lazy dog, twice over".to_vec();
        let packets = peer.packets(&data, 32, "fox.txt");
        assert!(packets.len() > 1);
        let last = packets.len() - 1;
        for (i, p) in packets.into_iter().enumerate() {
            let out = peer.send(&mut session, &store, Request::SendFile(p));
            if i < last {
                assert!(out.response.is_none());
                assert_eq!(session.state(), SessionState::Transferring);
                continue;
            }
            match out.response {
                Some(Response::FileReceived {
                    filename, checksum, ..
                }) => {
                    assert_eq!(filename, "fox.txt");
                    assert_eq!(checksum, checksum::compute(&data));
                }
                other => panic!("expected FileReceived, got {other:?}"),
            }
            assert!(matches!(
                &out.effects[..],
                [Effect::StoreFile { contents, .. }] if *contents == data
            ));
        }

        let out = peer.send(&mut session, &store, Request::ChecksumOk { filename: "fox.txt".into() });
        assert_eq!(out.response, Some(Response::Ack { peer_id: peer.id }));
        assert_eq!(
            out.effects,
            vec![Effect::FileVerified {
                peer_id: peer.id,
                filename: "fox.txt".into()
            }]
        );
        assert_eq!(session.state(), SessionState::KeyExchanged);
        assert!(session.transfer_filename().is_none());
    }

    #[test]
    fn corrupted_packet_two_retries_once_then_succeeds() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        // 60 bytes -> 16 IV + 64 ciphertext -> three packets of 32, 32, 16.
        let data: Vec<u8> = (0..60u8).collect();
        let packets = peer.packets(&data, 32, "three.bin");
        assert_eq!(packets.len(), 3);
        let expected = checksum::compute(&data);

        let mut corrupted = packets.clone();
        corrupted[1].content[0] ^= 0x01;
        let mut report = None;
        for p in corrupted {
            report = peer.send(&mut session, &store, Request::SendFile(p)).response;
        }
        let Some(Response::FileReceived { checksum, .. }) = report else {
            panic!("expected FileReceived");
        };
        assert_ne!(checksum, expected);
        assert_eq!(session.pending_checksum(), Some(checksum));

        let out = peer.send(&mut session, &store, Request::ChecksumRetry { filename: "three.bin".into() });
        assert_eq!(out.response, Some(Response::Ack { peer_id: peer.id }));
        assert_eq!(session.state(), SessionState::Transferring);
        assert_eq!(session.retries(), 1);
        assert_eq!(session.pending_checksum(), None);

        let mut report = None;
        for p in packets {
            report = peer.send(&mut session, &store, Request::SendFile(p)).response;
        }
        let Some(Response::FileReceived { checksum, .. }) = report else {
            panic!("expected FileReceived");
        };
        assert_eq!(checksum, expected);
        peer.send(&mut session, &store, Request::ChecksumOk { filename: "three.bin".into() });
        assert_eq!(session.state(), SessionState::KeyExchanged);
    }

    #[test]
    fn duplicate_packet_two_before_one() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let data: Vec<u8> = (0..60u8).rev().collect();
        let packets = peer.packets(&data, 32, "dup.bin");
        for i in [1usize, 1, 0] {
            let out = peer.send(&mut session, &store, Request::SendFile(packets[i].clone()));
            assert!(out.response.is_none());
        }
        let out = peer.send(&mut session, &store, Request::SendFile(packets[2].clone()));
        assert!(matches!(
            &out.effects[..],
            [Effect::StoreFile { contents, .. }] if *contents == data
        ));
    }

    #[test]
    fn late_duplicate_while_awaiting_verdict_is_absorbed() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let data: Vec<u8> = (0..60u8).collect();
        let packets = peer.packets(&data, 32, "f.bin");
        assert_eq!(packets.len(), 3);
        let mut report = None;
        for p in &packets {
            report = peer.send(&mut session, &store, Request::SendFile(p.clone())).response;
        }
        assert!(matches!(report, Some(Response::FileReceived { .. })));

        let out = peer.send(&mut session, &store, Request::SendFile(packets[1].clone()));
        assert!(out.response.is_none());
        assert!(out.error.is_none());
        assert!(out.effects.is_empty());
        assert!(!out.close);
        assert_eq!(session.pending_checksum(), Some(checksum::compute(&data)));

        let ok = peer.send(&mut session, &store, Request::ChecksumOk { filename: "f.bin".into() });
        assert!(matches!(ok.response, Some(Response::Ack { .. })));
        assert_eq!(session.state(), SessionState::KeyExchanged);
    }

    #[test]
    fn out_of_range_packet_while_awaiting_verdict_is_violation() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let packets = peer.packets(&[7u8; 40], 32, "f.bin");
        for p in &packets {
            peer.send(&mut session, &store, Request::SendFile(p.clone()));
        }
        let mut stray = packets[0].clone();
        stray.packet_number = packets.len() as u16 + 1;
        let out = peer.send(&mut session, &store, Request::SendFile(stray));
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::ProtocolViolation)));
        assert_eq!(session.state(), SessionState::Transferring);
    }

    #[test]
    fn completion_decrypts_across_many_chunks() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 13 % 256) as u8).collect();
        let packets = peer.packets(&data, 32, "many.bin");
        assert!(packets.len() > 30);
        let mut last = SessionOutput::default();
        for p in packets.into_iter().rev() {
            last = peer.send(&mut session, &store, Request::SendFile(p));
        }
        match last.response {
            Some(Response::FileReceived { checksum: sum, content_size, .. }) => {
                assert_eq!(sum, checksum::compute(&data));
                assert_eq!(content_size as u64, cipher::ciphertext_len(1000));
            }
            other => panic!("expected FileReceived, got {other:?}"),
        }
        assert!(matches!(
            &last.effects[..],
            [Effect::StoreFile { contents, .. }] if *contents == data
        ));
    }

    #[test]
    fn retries_exhausted_fails_session() {
        let store = MemoryStore::new();
        let config = SessionConfig {
            max_checksum_retries: 1,
            ..small_packets()
        };
        let (mut session, peer) = ready(&store, config);
        let packets = peer.packets(b"payload", 32, "p.txt");
        for round in 0..2 {
            for p in &packets {
                peer.send(&mut session, &store, Request::SendFile(p.clone()));
            }
            let out = peer.send(&mut session, &store, Request::ChecksumRetry { filename: "p.txt".into() });
            if round == 0 {
                assert_eq!(out.response, Some(Response::Ack { peer_id: peer.id }));
            } else {
                assert_eq!(out.response, Some(Response::Rejected(ErrorCode::ChecksumFailed)));
                assert!(out.close);
                assert!(matches!(&out.effects[..], [Effect::DiscardFile { .. }]));
            }
        }
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn abort_discards_and_closes() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        for p in peer.packets(b"payload", 32, "p.txt") {
            peer.send(&mut session, &store, Request::SendFile(p));
        }
        let out = peer.send(&mut session, &store, Request::ChecksumAbort { filename: "p.txt".into() });
        assert_eq!(out.response, Some(Response::Ack { peer_id: peer.id }));
        assert!(out.close);
        assert_eq!(
            out.effects,
            vec![Effect::DiscardFile {
                peer_id: peer.id,
                filename: "p.txt".into()
            }]
        );
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn verdict_for_wrong_file_is_violation() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        for p in peer.packets(b"payload", 32, "p.txt") {
            peer.send(&mut session, &store, Request::SendFile(p));
        }
        let out = peer.send(&mut session, &store, Request::ChecksumOk { filename: "q.txt".into() });
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::ProtocolViolation)));
        assert_eq!(session.state(), SessionState::Transferring);
    }

    #[test]
    fn second_file_while_first_open_is_violation() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let first = peer.packets(&[7u8; 100], 32, "one.bin");
        let second = peer.packets(&[8u8; 100], 32, "two.bin");
        peer.send(&mut session, &store, Request::SendFile(first[0].clone()));
        let out = peer.send(&mut session, &store, Request::SendFile(second[0].clone()));
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::ProtocolViolation)));
        assert_eq!(session.transfer_filename(), Some("one.bin"));
    }

    #[test]
    fn overflow_is_fatal() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let packet = FilePacket {
            content_size: 64,
            original_size: 10,
            packet_number: 1,
            total_packets: 2,
            filename: "big.bin".into(),
            content: vec![0; 64],
        };
        let out = peer.send(&mut session, &store, Request::SendFile(packet));
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::TransferOverflow)));
        assert!(out.close);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.transfer_filename().is_none());
    }

    #[test]
    fn undecryptable_file_is_fatal() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let other = SessionKey::generate();
        let ct = cipher::encrypt(&other, b"sixteen byte msg and then some");
        // Declared size no decryption of two blocks can produce, so padding luck cannot pass.
        let packets = split(&ct, 32, "x.bin", 100).unwrap();
        let mut last = SessionOutput::default();
        for p in packets {
            last = peer.send(&mut session, &store, Request::SendFile(p));
        }
        assert_eq!(last.response, Some(Response::Rejected(ErrorCode::DecryptionFailed)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn corruption_in_last_packet_breaks_padding_not_checksum() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let data = [3u8; 40];
        let mut ct = cipher::encrypt(peer.key.as_ref().unwrap(), &data);
        assert_eq!(ct.len(), 64);
        // Flips the high bit of the padding byte (0x08 -> 0x88) via the previous block.
        let at = ct.len() - 17;
        ct[at] ^= 0x80;
        let packets = split(&ct, 32, "tail.bin", data.len() as u64).unwrap();
        assert_eq!(packets.len(), 2);
        let mut last = SessionOutput::default();
        for p in packets {
            last = peer.send(&mut session, &store, Request::SendFile(p));
        }
        assert_eq!(last.response, Some(Response::Rejected(ErrorCode::DecryptionFailed)));
        assert!(last.close);
        assert!(session.pending_checksum().is_none());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn bad_public_key_fails_session() {
        let store = MemoryStore::new();
        let mut session = Session::new(SessionConfig::default());
        let mut peer = Peer::new();
        peer.register(&mut session, &store, "alice");
        let out = peer.send(
            &mut session,
            &store,
            Request::SendPublicKey {
                name: "alice".into(),
                public_key: vec![0u8; 32],
            },
        );
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::KeyExchangeFailed)));
        assert!(out.close);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn wrong_header_peer_id_is_violation() {
        let store = MemoryStore::new();
        let (mut session, mut peer) = ready(&store, small_packets());
        peer.id = PeerId::generate();
        let out = peer.send(&mut session, &store, Request::ChecksumOk { filename: "x".into() });
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::ProtocolViolation)));
        assert_eq!(session.state(), SessionState::KeyExchanged);
    }

    #[test]
    fn unknown_opcode_is_survivable() {
        let store = MemoryStore::new();
        let mut session = Session::new(SessionConfig::default());
        let header = RequestHeader::new(PeerId::UNASSIGNED, 4242, 0);
        let out = session.handle(&header, &[], &store);
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::ProtocolViolation)));
        assert!(!out.close);
        assert_eq!(session.state(), SessionState::Unregistered);
    }

    #[test]
    fn malformed_payload_is_fatal() {
        let store = MemoryStore::new();
        let mut session = Session::new(SessionConfig::default());
        let header = RequestHeader::new(PeerId::UNASSIGNED, RequestCode::Register as u16, 4);
        let out = session.handle(&header, b"abcd", &store);
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::MalformedRequest)));
        assert!(out.close);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn reconnect_issues_new_key() {
        let store = MemoryStore::new();
        let (mut first, mut peer) = ready(&store, SessionConfig::default());
        first.on_disconnect();
        assert_eq!(first.state(), SessionState::Completed);

        let mut second = Session::new(SessionConfig::default());
        let out = peer.send(&mut second, &store, Request::Reconnect { name: "alice".into() });
        let Some(Response::ReconnectOk { peer_id, wrapped_key }) = out.response else {
            panic!("expected ReconnectOk");
        };
        assert_eq!(peer_id, peer.id);
        let key = peer.keypair.unwrap_session_key(&wrapped_key).unwrap();
        assert_ne!(Some(&key), peer.key.as_ref());
        assert_eq!(second.session_key(), Some(&key));
        assert_eq!(second.state(), SessionState::KeyExchanged);
        peer.key = Some(key);
    }

    #[test]
    fn reconnect_denied_for_unknown_or_mismatched() {
        let store = MemoryStore::new();
        let (_, peer) = ready(&store, SessionConfig::default());

        let mut session = Session::new(SessionConfig::default());
        let out = peer.send(&mut session, &store, Request::Reconnect { name: "mallory".into() });
        assert_eq!(out.response, Some(Response::ReconnectDenied { peer_id: peer.id }));
        assert_eq!(session.state(), SessionState::Unregistered);

        let stranger = Peer::new();
        let out = stranger.send(&mut session, &store, Request::Reconnect { name: "alice".into() });
        assert_eq!(
            out.response,
            Some(Response::ReconnectDenied { peer_id: PeerId::UNASSIGNED })
        );
    }

    #[test]
    fn terminal_session_drops_requests() {
        let store = MemoryStore::new();
        let mut session = Session::new(SessionConfig::default());
        session.on_idle_timeout();
        let out = Peer::new().send(&mut session, &store, Request::Register { name: "bob".into() });
        assert!(out.response.is_none());
        assert!(out.close);
        assert_eq!(out.error, Some(SessionError::Terminated));
    }

    #[test]
    fn disconnect_mid_transfer_fails() {
        let store = MemoryStore::new();
        let (mut session, peer) = ready(&store, small_packets());
        let packets = peer.packets(&[1u8; 100], 32, "x.bin");
        peer.send(&mut session, &store, Request::SendFile(packets[0].clone()));
        session.on_disconnect();
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.transfer_filename().is_none());
    }

    #[test]
    fn storage_failure_fails_session() {
        let store = MemoryStore::new();
        let (mut session, _) = ready(&store, small_packets());
        let out = session.on_storage_failure(StoreError::Persist("disk full".into()));
        assert_eq!(out.response, Some(Response::Rejected(ErrorCode::GeneralError)));
        assert!(out.close);
        assert_eq!(session.state(), SessionState::Failed);
    }

    fn allowed(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        from == to
            || matches!(
                (from, to),
                (Unregistered, Registered)
                    | (Unregistered, KeyExchanged)
                    | (Registered, KeyExchanged)
                    | (KeyExchanged, Transferring)
                    | (Transferring, KeyExchanged)
                    | (_, Failed)
            )
    }

    fn arb_request() -> impl Strategy<Value = (u16, Vec<u8>)> {
        (1024u16..1033, prop::collection::vec(any::<u8>(), 0..300))
    }

    proptest! {
        #[test]
        fn random_traffic_never_skips_states(frames in prop::collection::vec(arb_request(), 1..40)) {
            let store = MemoryStore::new();
            let mut session = Session::new(small_packets());
            for (opcode, payload) in frames {
                let before = session.state();
                let header = RequestHeader::new(
                    session.peer_id().unwrap_or(PeerId::UNASSIGNED),
                    opcode,
                    payload.len() as u32,
                );
                let out = session.handle(&header, &payload, &store);
                let after = session.state();
                prop_assert!(allowed(before, after), "{:?} -> {:?}", before, after);
                if before.is_terminal() {
                    prop_assert!(out.response.is_none());
                }
                if let Some(Response::Rejected(ErrorCode::ProtocolViolation)) = out.response {
                    if !before.is_terminal() {
                        prop_assert_eq!(before, after);
                    }
                }
                if out.close {
                    prop_assert!(after.is_terminal());
                }
            }
        }
    }
}
