//! Framing: fixed-layout little-endian headers followed by a length-declared payload.
//!
//! ```text
//! request:  peer_id[16] | version:u8 | opcode:u16 | payload_size:u32 | payload
//! response: version:u8 | status:u16 | payload_size:u32 | payload
//! ```

use crate::identity::{PeerId, PEER_ID_SIZE};
use crate::protocol::PROTOCOL_VERSION;

pub const REQUEST_HEADER_SIZE: usize = PEER_ID_SIZE + 1 + 2 + 4;
pub const RESPONSE_HEADER_SIZE: usize = 1 + 2 + 4;
/// Hard upper bound on any payload, independent of server configuration.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024; // 16 MiB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub peer_id: PeerId,
    pub version: u8,
    pub opcode: u16,
    pub payload_size: u32,
}

impl RequestHeader {
    pub fn new(peer_id: PeerId, opcode: u16, payload_size: u32) -> Self {
        Self {
            peer_id,
            version: PROTOCOL_VERSION,
            opcode,
            payload_size,
        }
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut out = [0u8; REQUEST_HEADER_SIZE];
        out[..16].copy_from_slice(self.peer_id.as_bytes());
        out[16] = self.version;
        out[17..19].copy_from_slice(&self.opcode.to_le_bytes());
        out[19..23].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    /// Parse the fixed header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < REQUEST_HEADER_SIZE {
            return Err(WireError::MalformedHeader);
        }
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(&bytes[..16]);
        Ok(Self {
            peer_id: PeerId::from_bytes(id),
            version: bytes[16],
            opcode: u16::from_le_bytes([bytes[17], bytes[18]]),
            payload_size: u32::from_le_bytes([bytes[19], bytes[20], bytes[21], bytes[22]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub status: u16,
    pub payload_size: u32,
}

impl ResponseHeader {
    pub fn new(status: u16, payload_size: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            status,
            payload_size,
        }
    }

    pub fn to_bytes(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut out = [0u8; RESPONSE_HEADER_SIZE];
        out[0] = self.version;
        out[1..3].copy_from_slice(&self.status.to_le_bytes());
        out[3..7].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < RESPONSE_HEADER_SIZE {
            return Err(WireError::MalformedHeader);
        }
        Ok(Self {
            version: bytes[0],
            status: u16::from_le_bytes([bytes[1], bytes[2]]),
            payload_size: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        })
    }
}

/// Encode a request: header then payload. `header.payload_size` must equal `payload.len()`.
pub fn encode_request(header: &RequestHeader, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    check_declared(header.payload_size, payload.len())?;
    let mut out = Vec::with_capacity(REQUEST_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one complete request. The buffer must hold exactly one header and its payload.
pub fn decode_request(bytes: &[u8]) -> Result<(RequestHeader, &[u8]), WireError> {
    let header = RequestHeader::parse(bytes)?;
    let payload = &bytes[REQUEST_HEADER_SIZE..];
    check_available(header.payload_size, payload.len())?;
    Ok((header, payload))
}

pub fn encode_response(header: &ResponseHeader, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    check_declared(header.payload_size, payload.len())?;
    let mut out = Vec::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn decode_response(bytes: &[u8]) -> Result<(ResponseHeader, &[u8]), WireError> {
    let header = ResponseHeader::parse(bytes)?;
    let payload = &bytes[RESPONSE_HEADER_SIZE..];
    check_available(header.payload_size, payload.len())?;
    Ok((header, payload))
}

fn check_declared(declared: u32, actual: usize) -> Result<(), WireError> {
    if actual > MAX_PAYLOAD_SIZE as usize {
        return Err(WireError::PayloadTooLarge(actual as u64));
    }
    check_available(declared, actual)
}

fn check_available(declared: u32, actual: usize) -> Result<(), WireError> {
    if declared as usize != actual {
        return Err(WireError::PayloadSizeMismatch {
            declared: declared as u64,
            actual: actual as u64,
        });
    }
    Ok(())
}

/// Error encoding or decoding a frame or its payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed header")]
    MalformedHeader,
    #[error("payload size mismatch: declared {declared}, actual {actual}")]
    PayloadSizeMismatch { declared: u64, actual: u64 },
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(u64),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("unknown status code {0}")]
    UnknownStatus(u16),
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),
    #[error("field too long: {len} bytes, limit {limit}")]
    FieldTooLong { len: usize, limit: usize },
}
