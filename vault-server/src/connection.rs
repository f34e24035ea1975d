//! Per-connection task: read a request frame, route it through the session, apply effects,
//! write the response.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vault_core::store::unix_now;
use vault_core::wire::{RequestHeader, WireError, REQUEST_HEADER_SIZE};
use vault_core::{Effect, FileRecord, PeerId, Session, SessionOutput, StoreError};

use crate::dispatcher::{route, Shared};

enum ReadError {
    Io(std::io::Error),
    /// Header refused (bad version, oversized payload); the payload is left unread.
    Refused(WireError),
}

/// Read one request: fixed header, then exactly `payload_size` bytes.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> Result<(RequestHeader, Vec<u8>), ReadError> {
    let mut buf = [0u8; REQUEST_HEADER_SIZE];
    reader.read_exact(&mut buf).await.map_err(ReadError::Io)?;
    let header = RequestHeader::parse(&buf).map_err(ReadError::Refused)?;
    if header.payload_size as usize > max_payload {
        return Err(ReadError::Refused(WireError::PayloadTooLarge(
            header.payload_size as u64,
        )));
    }
    let mut payload = vec![0u8; header.payload_size as usize];
    reader.read_exact(&mut payload).await.map_err(ReadError::Io)?;
    Ok((header, payload))
}

// Resolves when the registry replaces or disconnects this connection; never before registration.
async fn kicked(kick: &mut Option<oneshot::Receiver<()>>) {
    match kick.as_mut() {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Serve one client until it disconnects, fails, idles out, is replaced, or the server stops.
pub(crate) async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connection_id: u64,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let mut session = Session::new(shared.config.session_config());
    let idle = shared.config.idle_timeout();
    let max_payload = shared.config.max_payload_size();
    let mut kick: Option<oneshot::Receiver<()>> = None;
    let mut registered: Option<PeerId> = None;
    info!(event = "connection_open", conn = connection_id, %addr);

    loop {
        if *shutdown.borrow() {
            session.on_disconnect();
            break;
        }
        let read = tokio::select! {
            r = timeout(idle, read_frame(&mut reader, max_payload)) => r,
            _ = shutdown.changed() => {
                debug!(event = "connection_shutdown", conn = connection_id);
                session.on_disconnect();
                break;
            }
            _ = kicked(&mut kick) => {
                info!(event = "connection_replaced", conn = connection_id, peer = ?registered);
                session.on_disconnect();
                break;
            }
        };
        let output = match read {
            Err(_) => {
                info!(event = "idle_timeout", conn = connection_id, state = ?session.state());
                session.on_idle_timeout();
                break;
            }
            Ok(Err(ReadError::Io(e))) => {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    debug!(event = "peer_closed", conn = connection_id);
                } else {
                    warn!(event = "read_failed", conn = connection_id, error = %e);
                }
                session.on_disconnect();
                break;
            }
            Ok(Err(ReadError::Refused(e))) => session.on_frame_error(e),
            Ok(Ok((header, payload))) => route(&mut session, &header, &payload, shared.store.as_ref()),
        };
        let output = apply_effects(&shared, &mut session, output);

        if let Some(e) = &output.error {
            warn!(
                event = "request_rejected",
                conn = connection_id,
                peer = ?session.peer_id(),
                error = %e,
                fatal = e.is_fatal()
            );
        }

        if registered.is_none() {
            if let Some(peer) = session.peer_id() {
                kick = Some(shared.registry.insert(peer, connection_id, addr).await);
                registered = Some(peer);
                info!(event = "peer_bound", conn = connection_id, peer = %peer);
            }
        }

        if let Some(response) = &output.response {
            match response.to_frame() {
                Ok(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!(event = "write_failed", conn = connection_id, error = %e);
                        session.on_disconnect();
                        break;
                    }
                }
                Err(e) => warn!(event = "encode_failed", conn = connection_id, error = %e),
            }
        }
        if output.close {
            break;
        }
    }

    let _ = writer.shutdown().await;
    if let Some(peer) = registered {
        shared.registry.remove(&peer, connection_id).await;
    }
    info!(
        event = "connection_closed",
        conn = connection_id,
        peer = ?registered,
        state = ?session.state()
    );
}

/// Carry out the session's effects. A storage failure replaces the output with a general error.
fn apply_effects(shared: &Shared, session: &mut Session, output: SessionOutput) -> SessionOutput {
    for effect in &output.effects {
        if let Err(e) = apply_effect(shared, effect) {
            warn!(event = "effect_failed", peer = ?session.peer_id(), error = %e);
            return session.on_storage_failure(e);
        }
    }
    output
}

fn apply_effect(shared: &Shared, effect: &Effect) -> Result<(), StoreError> {
    match effect {
        Effect::StoreFile {
            peer_id,
            filename,
            contents,
            checksum,
        } => {
            let path = shared
                .storage
                .write(peer_id, filename, contents)
                .map_err(|e| StoreError::Persist(e.to_string()))?;
            shared.store.record_file(FileRecord {
                peer_id: *peer_id,
                filename: filename.clone(),
                path: path.display().to_string(),
                original_size: contents.len() as u32,
                checksum: *checksum,
                verified: false,
                stored_at: unix_now(),
            })?;
            info!(event = "file_stored", peer = %peer_id, file = %filename, bytes = contents.len());
        }
        Effect::FileVerified { peer_id, filename } => {
            shared.store.mark_verified(peer_id, filename)?;
            info!(event = "file_verified", peer = %peer_id, file = %filename);
        }
        Effect::DiscardFile { peer_id, filename } => {
            shared
                .storage
                .remove(peer_id, filename)
                .map_err(|e| StoreError::Persist(e.to_string()))?;
            match shared.store.remove_file(peer_id, filename) {
                Ok(()) | Err(StoreError::UnknownFile(_)) => {}
                Err(e) => return Err(e),
            }
            info!(event = "file_discarded", peer = %peer_id, file = %filename);
        }
    }
    Ok(())
}
