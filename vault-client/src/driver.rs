//! Client side of a transfer: handshake, encrypted upload, checksum verdict.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vault_core::checksum::{Checksum, CHECKSUM_WINDOW};
use vault_core::cipher::ciphertext_len;
use vault_core::wire::{ResponseHeader, MAX_PAYLOAD_SIZE, RESPONSE_HEADER_SIZE};
use vault_core::{Keypair, PacketPlan, PeerId, Request, Response, SessionKey, StreamEncryptor};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::identity::{self, IdentityFile};

/// Outcome of a verified upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub peer_id: PeerId,
    pub filename: String,
    pub bytes: u64,
    pub packets: u16,
    pub checksum: u32,
    /// Times the file was sent; 1 when the first attempt verified.
    pub attempts: u32,
    /// True when the session was resumed from the identity file.
    pub reconnected: bool,
}

pub struct Driver {
    config: ClientConfig,
}

impl Driver {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Upload `path` to the server at `addr` as `name`. Succeeds only once the server has
    /// confirmed a checksum equal to the local one.
    pub async fn submit(
        &self,
        path: &Path,
        addr: &str,
        name: &str,
    ) -> Result<TransferReport, ClientError> {
        self.config.validate()?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "file name is missing or not UTF-8",
                ))
            })?
            .to_string();
        let size = tokio::fs::metadata(path).await?.len();

        let mut conn = Connection::open(addr, &self.config).await?;
        let (key, reconnected) = self.handshake(&mut conn, name).await?;
        info!(event = "session_ready", peer = %conn.peer_id, reconnected);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (local, packets) = self
                .send_file(&mut conn, &key, path, &filename, size)
                .await?;
            let remote = match conn.recv().await? {
                Response::FileReceived {
                    filename: reported,
                    checksum,
                    ..
                } if reported == filename => checksum,
                other => return Err(unexpected(&other)),
            };

            if remote == local {
                expect_ack(conn.request(&Request::ChecksumOk {
                    filename: filename.clone(),
                }))
                .await?;
                info!(event = "transfer_verified", file = %filename, bytes = size, attempts = attempt);
                return Ok(TransferReport {
                    peer_id: conn.peer_id,
                    filename,
                    bytes: size,
                    packets,
                    checksum: local,
                    attempts: attempt,
                    reconnected,
                });
            }

            warn!(
                event = "checksum_mismatch",
                file = %filename,
                local = format_args!("{local:08x}"),
                remote = format_args!("{remote:08x}"),
                attempt
            );
            if attempt > self.config.max_retries {
                let abort = conn
                    .request(&Request::ChecksumAbort {
                        filename: filename.clone(),
                    })
                    .await;
                if let Err(e) = abort {
                    debug!(event = "abort_unacknowledged", error = %e);
                }
                return Err(ClientError::ChecksumFailed { attempts: attempt });
            }
            expect_ack(conn.request(&Request::ChecksumRetry {
                filename: filename.clone(),
            }))
            .await
            .map_err(|e| match e {
                // The server's retry budget ran out before ours.
                ClientError::ChecksumFailed { .. } => {
                    ClientError::ChecksumFailed { attempts: attempt }
                }
                other => other,
            })?;
            debug!(event = "resending", file = %filename, attempt = attempt + 1);
            tokio::time::sleep(self.config.retry_backoff(attempt)).await;
        }
    }

    /// Resume with the stored identity when it matches `name`, otherwise register and exchange keys.
    async fn handshake(
        &self,
        conn: &mut Connection,
        name: &str,
    ) -> Result<(SessionKey, bool), ClientError> {
        let id_path = self.config.identity_path();
        if let Some(id) = identity::load(&id_path)?.filter(|id| id.name == name) {
            let keypair = id.keypair().map_err(|reason| ClientError::Identity {
                path: id_path.clone(),
                reason,
            })?;
            conn.peer_id = id.peer_id;
            match conn.request(&Request::Reconnect { name: name.into() }).await? {
                Response::ReconnectOk {
                    peer_id,
                    wrapped_key,
                } if peer_id == id.peer_id => {
                    let key = keypair.unwrap_session_key(&wrapped_key)?;
                    return Ok((key, true));
                }
                Response::ReconnectDenied { .. } => {
                    info!(event = "reconnect_denied", peer = %id.peer_id);
                    conn.peer_id = PeerId::UNASSIGNED;
                }
                other => return Err(unexpected(&other)),
            }
        }

        let peer_id = match conn.request(&Request::Register { name: name.into() }).await? {
            Response::RegisterOk { peer_id } => peer_id,
            Response::RegisterFailed => return Err(ClientError::RegistrationRefused(name.into())),
            other => return Err(unexpected(&other)),
        };
        conn.peer_id = peer_id;
        info!(event = "registered", peer = %peer_id, name);

        let keypair = Keypair::generate();
        let wrapped = match conn
            .request(&Request::SendPublicKey {
                name: name.into(),
                public_key: keypair.public_key().as_bytes().to_vec(),
            })
            .await?
        {
            Response::KeyAccepted { wrapped_key, .. } => wrapped_key,
            other => return Err(unexpected(&other)),
        };
        let key = keypair.unwrap_session_key(&wrapped)?;
        identity::save(&id_path, &IdentityFile::new(name, peer_id, &keypair))?;
        Ok((key, false))
    }

    /// Encrypt and send the whole file, reading it in fixed windows.
    /// Returns the plaintext checksum and the packet count.
    async fn send_file(
        &self,
        conn: &mut Connection,
        key: &SessionKey,
        path: &Path,
        filename: &str,
        size: u64,
    ) -> Result<(u32, u16), ClientError> {
        let max = self.config.max_packet_size;
        let mut plan = PacketPlan::new(filename, size, ciphertext_len(size), max)?;
        let total = plan.total_packets();
        let mut file = tokio::fs::File::open(path).await?;
        let mut encryptor = StreamEncryptor::new(key);
        let mut checksum = Checksum::new();
        let mut window = vec![0u8; CHECKSUM_WINDOW];
        let mut pending = Vec::with_capacity(max + CHECKSUM_WINDOW);
        let mut read = 0u64;
        debug!(event = "sending_file", file = %filename, bytes = size, packets = total);

        loop {
            let n = file.read(&mut window).await?;
            if n == 0 {
                break;
            }
            read += n as u64;
            checksum.update(&window[..n]);
            pending.extend_from_slice(&encryptor.update(&window[..n]));
            while pending.len() >= max {
                let rest = pending.split_off(max);
                let content = std::mem::replace(&mut pending, rest);
                send_packet(conn, &mut plan, content).await?;
            }
        }
        if read != size {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "file changed while it was being sent",
            )));
        }
        pending.extend_from_slice(&encryptor.finish());
        while !pending.is_empty() {
            let take = pending.len().min(max);
            let rest = pending.split_off(take);
            let content = std::mem::replace(&mut pending, rest);
            send_packet(conn, &mut plan, content).await?;
        }
        if !plan.is_done() {
            return Err(ClientError::ProtocolViolation(
                "fewer packets produced than announced".into(),
            ));
        }
        Ok((checksum.finalize(), total))
    }
}

/// Upload with default settings.
pub async fn submit(path: &Path, addr: &str, name: &str) -> Result<TransferReport, ClientError> {
    Driver::new(ClientConfig::default())
        .submit(path, addr, name)
        .await
}

async fn send_packet(
    conn: &mut Connection,
    plan: &mut PacketPlan,
    content: Vec<u8>,
) -> Result<(), ClientError> {
    let packet = plan.next_packet(content).ok_or_else(|| {
        ClientError::ProtocolViolation("more packets produced than announced".into())
    })?;
    conn.send(&Request::SendFile(packet)).await
}

async fn expect_ack(
    response: impl std::future::Future<Output = Result<Response, ClientError>>,
) -> Result<(), ClientError> {
    match response.await? {
        Response::Ack { .. } => Ok(()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> ClientError {
    ClientError::ProtocolViolation(format!("unexpected response status {}", response.status()))
}

fn connection_error(what: &str, e: std::io::Error) -> ClientError {
    ClientError::Connection(format!("{what}: {e}"))
}

struct Connection {
    stream: TcpStream,
    peer_id: PeerId,
    response_timeout: Duration,
}

impl Connection {
    async fn open(addr: &str, config: &ClientConfig) -> Result<Self, ClientError> {
        let stream = timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Connection(format!("connecting to {addr} timed out")))?
            .map_err(|e| connection_error(&format!("connecting to {addr}"), e))?;
        let _ = stream.set_nodelay(true);
        debug!(event = "connected", addr);
        Ok(Self {
            stream,
            peer_id: PeerId::UNASSIGNED,
            response_timeout: config.response_timeout(),
        })
    }

    async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        let frame = request.to_frame(self.peer_id)?;
        if let Err(e) = self.stream.write_all(&frame).await {
            // The server answers a fatal error and then closes; report its reason if one arrived.
            if let Ok(Err(reason)) =
                timeout(Duration::from_secs(1), read_response(&mut self.stream)).await
            {
                if !matches!(reason, ClientError::Connection(_)) {
                    return Err(reason);
                }
            }
            return Err(connection_error("sending request", e));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Response, ClientError> {
        timeout(self.response_timeout, read_response(&mut self.stream))
            .await
            .map_err(|_| ClientError::Connection("timed out waiting for a response".into()))?
    }

    async fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
        self.send(request).await?;
        self.recv().await
    }
}

/// Read one response frame. Error statuses come back as the matching `ClientError`.
async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Response, ClientError> {
    let mut head = [0u8; RESPONSE_HEADER_SIZE];
    reader
        .read_exact(&mut head)
        .await
        .map_err(|e| connection_error("reading response", e))?;
    let header = ResponseHeader::parse(&head)?;
    if header.payload_size > MAX_PAYLOAD_SIZE {
        return Err(vault_core::WireError::PayloadTooLarge(header.payload_size as u64).into());
    }
    let mut payload = vec![0u8; header.payload_size as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| connection_error("reading response", e))?;
    match Response::decode(&header, &payload)? {
        Response::Rejected(code) => Err(ClientError::from_rejection(code)),
        response => Ok(response),
    }
}
