//! Vault wire protocol: opcodes, status codes, typed requests/responses and their payload layouts.

use crate::identity::{PeerId, PEER_ID_SIZE};
use crate::wire::{self, RequestHeader, ResponseHeader, WireError};

/// Current protocol version. Carried in every header.
pub const PROTOCOL_VERSION: u8 = 4;

/// Width of the NUL-padded client name field.
pub const NAME_FIELD_SIZE: usize = 255;
/// Longest name that fits with its terminator.
pub const MAX_NAME_LEN: usize = NAME_FIELD_SIZE - 1;
/// Width of the NUL-padded filename field.
pub const FILENAME_FIELD_SIZE: usize = 255;
/// Fixed part of a file packet payload, before the ciphertext.
pub const PACKET_META_SIZE: usize = 4 + 4 + 2 + 2 + FILENAME_FIELD_SIZE;

/// Request opcodes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCode {
    Register = 1025,
    SendPublicKey = 1026,
    Reconnect = 1027,
    SendFile = 1028,
    ChecksumOk = 1029,
    ChecksumRetry = 1030,
    ChecksumAbort = 1031,
}

impl RequestCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1025 => Some(Self::Register),
            1026 => Some(Self::SendPublicKey),
            1027 => Some(Self::Reconnect),
            1028 => Some(Self::SendFile),
            1029 => Some(Self::ChecksumOk),
            1030 => Some(Self::ChecksumRetry),
            1031 => Some(Self::ChecksumAbort),
            _ => None,
        }
    }
}

/// Success status codes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    RegisterOk = 1600,
    RegisterFailed = 1601,
    PubkeyAckSessionKeySent = 1602,
    FileChecksumOk = 1603,
    MessageAck = 1604,
    ReconnectOk = 1605,
    ReconnectDenied = 1606,
}

/// Error status codes. All carry an empty payload.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    GeneralError = 1607,
    MalformedRequest = 1608,
    ProtocolViolation = 1609,
    TransferOverflow = 1610,
    KeyExchangeFailed = 1611,
    DecryptionFailed = 1612,
    ChecksumFailed = 1613,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1607 => Some(Self::GeneralError),
            1608 => Some(Self::MalformedRequest),
            1609 => Some(Self::ProtocolViolation),
            1610 => Some(Self::TransferOverflow),
            1611 => Some(Self::KeyExchangeFailed),
            1612 => Some(Self::DecryptionFailed),
            1613 => Some(Self::ChecksumFailed),
            _ => None,
        }
    }
}

/// One packet of a file's ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePacket {
    /// Ciphertext bytes in this packet.
    pub content_size: u32,
    /// Plaintext size of the whole file, repeated in every packet.
    pub original_size: u32,
    /// 1-based.
    pub packet_number: u16,
    pub total_packets: u16,
    pub filename: String,
    pub content: Vec<u8>,
}

impl FilePacket {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(PACKET_META_SIZE + self.content.len());
        out.extend_from_slice(&self.content_size.to_le_bytes());
        out.extend_from_slice(&self.original_size.to_le_bytes());
        out.extend_from_slice(&self.packet_number.to_le_bytes());
        out.extend_from_slice(&self.total_packets.to_le_bytes());
        out.extend_from_slice(&encode_padded(&self.filename, FILENAME_FIELD_SIZE)?);
        out.extend_from_slice(&self.content);
        Ok(out)
    }

    /// Parse a packet payload. `content_size` is not checked against the content here;
    /// reassembly does that.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < PACKET_META_SIZE {
            return Err(WireError::MalformedPayload("file packet shorter than its metadata"));
        }
        let le32 = |at: usize| {
            u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        };
        let le16 = |at: usize| u16::from_le_bytes([payload[at], payload[at + 1]]);
        Ok(Self {
            content_size: le32(0),
            original_size: le32(4),
            packet_number: le16(8),
            total_packets: le16(10),
            filename: decode_padded(&payload[12..PACKET_META_SIZE])?,
            content: payload[PACKET_META_SIZE..].to_vec(),
        })
    }
}

/// Typed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { name: String },
    /// `public_key` is kept raw; the session validates it as part of key exchange.
    SendPublicKey { name: String, public_key: Vec<u8> },
    Reconnect { name: String },
    SendFile(FilePacket),
    ChecksumOk { filename: String },
    ChecksumRetry { filename: String },
    ChecksumAbort { filename: String },
}

impl Request {
    pub fn code(&self) -> RequestCode {
        match self {
            Request::Register { .. } => RequestCode::Register,
            Request::SendPublicKey { .. } => RequestCode::SendPublicKey,
            Request::Reconnect { .. } => RequestCode::Reconnect,
            Request::SendFile(_) => RequestCode::SendFile,
            Request::ChecksumOk { .. } => RequestCode::ChecksumOk,
            Request::ChecksumRetry { .. } => RequestCode::ChecksumRetry,
            Request::ChecksumAbort { .. } => RequestCode::ChecksumAbort,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Request::Register { name } | Request::Reconnect { name } => {
                encode_padded(name, NAME_FIELD_SIZE)
            }
            Request::SendPublicKey { name, public_key } => {
                let mut out = encode_padded(name, NAME_FIELD_SIZE)?;
                out.extend_from_slice(public_key);
                Ok(out)
            }
            Request::SendFile(packet) => packet.encode(),
            Request::ChecksumOk { filename }
            | Request::ChecksumRetry { filename }
            | Request::ChecksumAbort { filename } => encode_padded(filename, FILENAME_FIELD_SIZE),
        }
    }

    /// Full frame (header + payload) sent as `peer_id`.
    pub fn to_frame(&self, peer_id: PeerId) -> Result<Vec<u8>, WireError> {
        let payload = self.encode_payload()?;
        let header = RequestHeader::new(peer_id, self.code() as u16, payload.len() as u32);
        wire::encode_request(&header, &payload)
    }

    pub fn decode(header: &RequestHeader, payload: &[u8]) -> Result<Self, WireError> {
        if header.version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(header.version));
        }
        if header.payload_size as usize != payload.len() {
            return Err(WireError::PayloadSizeMismatch {
                declared: header.payload_size as u64,
                actual: payload.len() as u64,
            });
        }
        let code =
            RequestCode::from_u16(header.opcode).ok_or(WireError::UnknownOpcode(header.opcode))?;
        match code {
            RequestCode::Register => Ok(Request::Register {
                name: decode_exact_field(payload, NAME_FIELD_SIZE)?,
            }),
            RequestCode::Reconnect => Ok(Request::Reconnect {
                name: decode_exact_field(payload, NAME_FIELD_SIZE)?,
            }),
            RequestCode::SendPublicKey => {
                if payload.len() < NAME_FIELD_SIZE {
                    return Err(WireError::MalformedPayload("public key payload too short"));
                }
                Ok(Request::SendPublicKey {
                    name: decode_padded(&payload[..NAME_FIELD_SIZE])?,
                    public_key: payload[NAME_FIELD_SIZE..].to_vec(),
                })
            }
            RequestCode::SendFile => Ok(Request::SendFile(FilePacket::decode(payload)?)),
            RequestCode::ChecksumOk => Ok(Request::ChecksumOk {
                filename: decode_exact_field(payload, FILENAME_FIELD_SIZE)?,
            }),
            RequestCode::ChecksumRetry => Ok(Request::ChecksumRetry {
                filename: decode_exact_field(payload, FILENAME_FIELD_SIZE)?,
            }),
            RequestCode::ChecksumAbort => Ok(Request::ChecksumAbort {
                filename: decode_exact_field(payload, FILENAME_FIELD_SIZE)?,
            }),
        }
    }
}

/// Typed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegisterOk { peer_id: PeerId },
    RegisterFailed,
    KeyAccepted { peer_id: PeerId, wrapped_key: Vec<u8> },
    FileReceived {
        peer_id: PeerId,
        content_size: u32,
        filename: String,
        checksum: u32,
    },
    Ack { peer_id: PeerId },
    ReconnectOk { peer_id: PeerId, wrapped_key: Vec<u8> },
    ReconnectDenied { peer_id: PeerId },
    Rejected(ErrorCode),
}

impl Response {
    pub fn status(&self) -> u16 {
        match self {
            Response::RegisterOk { .. } => StatusCode::RegisterOk as u16,
            Response::RegisterFailed => StatusCode::RegisterFailed as u16,
            Response::KeyAccepted { .. } => StatusCode::PubkeyAckSessionKeySent as u16,
            Response::FileReceived { .. } => StatusCode::FileChecksumOk as u16,
            Response::Ack { .. } => StatusCode::MessageAck as u16,
            Response::ReconnectOk { .. } => StatusCode::ReconnectOk as u16,
            Response::ReconnectDenied { .. } => StatusCode::ReconnectDenied as u16,
            Response::Rejected(code) => *code as u16,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            Response::RegisterOk { peer_id }
            | Response::Ack { peer_id }
            | Response::ReconnectDenied { peer_id } => out.extend_from_slice(peer_id.as_bytes()),
            Response::KeyAccepted {
                peer_id,
                wrapped_key,
            }
            | Response::ReconnectOk {
                peer_id,
                wrapped_key,
            } => {
                out.extend_from_slice(peer_id.as_bytes());
                out.extend_from_slice(wrapped_key);
            }
            Response::FileReceived {
                peer_id,
                content_size,
                filename,
                checksum,
            } => {
                out.extend_from_slice(peer_id.as_bytes());
                out.extend_from_slice(&content_size.to_le_bytes());
                out.extend_from_slice(&encode_padded(filename, FILENAME_FIELD_SIZE)?);
                out.extend_from_slice(&checksum.to_le_bytes());
            }
            Response::RegisterFailed | Response::Rejected(_) => {}
        }
        Ok(out)
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, WireError> {
        let payload = self.encode_payload()?;
        let header = ResponseHeader::new(self.status(), payload.len() as u32);
        wire::encode_response(&header, &payload)
    }

    pub fn decode(header: &ResponseHeader, payload: &[u8]) -> Result<Self, WireError> {
        if header.version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(header.version));
        }
        if let Some(code) = ErrorCode::from_u16(header.status) {
            return Ok(Response::Rejected(code));
        }
        let peer_id = || {
            payload
                .get(..PEER_ID_SIZE)
                .and_then(PeerId::from_slice)
                .ok_or(WireError::MalformedPayload("missing peer id"))
        };
        match header.status {
            1600 => Ok(Response::RegisterOk { peer_id: peer_id()? }),
            1601 => Ok(Response::RegisterFailed),
            1602 => Ok(Response::KeyAccepted {
                peer_id: peer_id()?,
                wrapped_key: payload[PEER_ID_SIZE..].to_vec(),
            }),
            1603 => {
                const LEN: usize = PEER_ID_SIZE + 4 + FILENAME_FIELD_SIZE + 4;
                if payload.len() != LEN {
                    return Err(WireError::MalformedPayload("file report has wrong length"));
                }
                let at = PEER_ID_SIZE;
                let content_size = u32::from_le_bytes([
                    payload[at],
                    payload[at + 1],
                    payload[at + 2],
                    payload[at + 3],
                ]);
                let name_end = at + 4 + FILENAME_FIELD_SIZE;
                Ok(Response::FileReceived {
                    peer_id: peer_id()?,
                    content_size,
                    filename: decode_padded(&payload[at + 4..name_end])?,
                    checksum: u32::from_le_bytes([
                        payload[name_end],
                        payload[name_end + 1],
                        payload[name_end + 2],
                        payload[name_end + 3],
                    ]),
                })
            }
            1604 => Ok(Response::Ack { peer_id: peer_id()? }),
            1605 => Ok(Response::ReconnectOk {
                peer_id: peer_id()?,
                wrapped_key: payload[PEER_ID_SIZE..].to_vec(),
            }),
            1606 => Ok(Response::ReconnectDenied { peer_id: peer_id()? }),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// Encode `s` into a NUL-padded field of `width` bytes. At least one NUL always terminates it.
pub fn encode_padded(s: &str, width: usize) -> Result<Vec<u8>, WireError> {
    let bytes = s.as_bytes();
    if bytes.len() >= width {
        return Err(WireError::FieldTooLong {
            len: bytes.len(),
            limit: width - 1,
        });
    }
    if bytes.contains(&0) {
        return Err(WireError::MalformedPayload("embedded NUL in string field"));
    }
    let mut out = vec![0u8; width];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Decode a NUL-padded field: text up to the first NUL, which must exist.
pub fn decode_padded(field: &[u8]) -> Result<String, WireError> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::MalformedPayload("string field not terminated"))?;
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| WireError::MalformedPayload("string field not utf-8"))
}

fn decode_exact_field(payload: &[u8], width: usize) -> Result<String, WireError> {
    if payload.len() != width {
        return Err(WireError::MalformedPayload("string field has wrong width"));
    }
    decode_padded(payload)
}
