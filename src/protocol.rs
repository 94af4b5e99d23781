//! Fixed-size wire frames exchanged with the pod manager and hook library.
//!
//! Every request occupies exactly `REQ_MSG_LEN` bytes and every response
//! exactly `RSP_MSG_LEN` bytes; integers and doubles are little-endian. The
//! layout is part of the protocol and must not change.

use thiserror::Error;

/// Bytes reserved for the NUL-padded client name at the head of a request.
pub const HOST_NAME_MAX: usize = 64;
/// Total request frame length.
pub const REQ_MSG_LEN: usize = 96;
/// Total response frame length.
pub const RSP_MSG_LEN: usize = 32;

const REQ_ID_OFFSET: usize = HOST_NAME_MAX;
const REQ_KIND_OFFSET: usize = REQ_ID_OFFSET + 4;
const REQ_PAYLOAD_OFFSET: usize = REQ_KIND_OFFSET + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    Quota = 0,
    MemLimit = 1,
    MemUpdate = 2,
}

impl RequestKind {
    fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Quota),
            1 => Some(Self::MemLimit),
            2 => Some(Self::MemUpdate),
            _ => None,
        }
    }
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub client_name: String,
    /// Echoed verbatim in the response.
    pub req_id: u32,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Ask for a fresh time quota.
    Quota {
        /// ms the client ran past its prior quota.
        overuse: f64,
        /// recent kernel burst estimate in ms.
        burst: f64,
    },
    /// Query memory accounting.
    MemLimit,
    /// Report an allocation or a free.
    MemUpdate { bytes: u64, is_allocate: bool },
}

impl RequestBody {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Quota { .. } => RequestKind::Quota,
            Self::MemLimit => RequestKind::MemLimit,
            Self::MemUpdate { .. } => RequestKind::MemUpdate,
        }
    }
}

/// Response payloads, paired with the echoed request id on encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Quota { quota: f64 },
    MemLimit { used: u64, limit: u64 },
    MemUpdate { verdict: bool },
}

impl Response {
    fn kind(&self) -> RequestKind {
        match self {
            Self::Quota { .. } => RequestKind::Quota,
            Self::MemLimit { .. } => RequestKind::MemLimit,
            Self::MemUpdate { .. } => RequestKind::MemUpdate,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown request kind {0}")]
    UnknownKind(u32),
    #[error("client name is empty")]
    EmptyName,
    #[error("client name is not valid UTF-8")]
    BadName(#[from] std::str::Utf8Error),
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("frame slice"))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("frame slice"))
}

fn read_f64(buf: &[u8], offset: usize) -> f64 {
    f64::from_le_bytes(buf[offset..offset + 8].try_into().expect("frame slice"))
}

/// Decode one request frame.
pub fn parse_request(buf: &[u8; REQ_MSG_LEN]) -> Result<Request, DecodeError> {
    let name_bytes = &buf[..HOST_NAME_MAX];
    let name_len = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(HOST_NAME_MAX);
    if name_len == 0 {
        return Err(DecodeError::EmptyName);
    }
    let client_name = std::str::from_utf8(&name_bytes[..name_len])?.to_string();

    let req_id = read_u32(buf, REQ_ID_OFFSET);
    let raw_kind = read_u32(buf, REQ_KIND_OFFSET);
    let kind = RequestKind::from_wire(raw_kind).ok_or(DecodeError::UnknownKind(raw_kind))?;

    let body = match kind {
        RequestKind::Quota => RequestBody::Quota {
            overuse: read_f64(buf, REQ_PAYLOAD_OFFSET),
            burst: read_f64(buf, REQ_PAYLOAD_OFFSET + 8),
        },
        RequestKind::MemLimit => RequestBody::MemLimit,
        RequestKind::MemUpdate => RequestBody::MemUpdate {
            bytes: read_u64(buf, REQ_PAYLOAD_OFFSET),
            is_allocate: read_u32(buf, REQ_PAYLOAD_OFFSET + 8) != 0,
        },
    };

    Ok(Request {
        client_name,
        req_id,
        body,
    })
}

/// Encode a request frame. The scheduler itself never sends requests; this is
/// the other half of the codec, used by the hook side and by tests.
pub fn encode_request(req: &Request) -> [u8; REQ_MSG_LEN] {
    let mut buf = [0u8; REQ_MSG_LEN];
    let name = req.client_name.as_bytes();
    let len = name.len().min(HOST_NAME_MAX - 1);
    buf[..len].copy_from_slice(&name[..len]);
    buf[REQ_ID_OFFSET..REQ_ID_OFFSET + 4].copy_from_slice(&req.req_id.to_le_bytes());
    buf[REQ_KIND_OFFSET..REQ_KIND_OFFSET + 4]
        .copy_from_slice(&(req.body.kind() as u32).to_le_bytes());
    match req.body {
        RequestBody::Quota { overuse, burst } => {
            buf[REQ_PAYLOAD_OFFSET..REQ_PAYLOAD_OFFSET + 8]
                .copy_from_slice(&overuse.to_le_bytes());
            buf[REQ_PAYLOAD_OFFSET + 8..REQ_PAYLOAD_OFFSET + 16]
                .copy_from_slice(&burst.to_le_bytes());
        }
        RequestBody::MemLimit => {}
        RequestBody::MemUpdate { bytes, is_allocate } => {
            buf[REQ_PAYLOAD_OFFSET..REQ_PAYLOAD_OFFSET + 8].copy_from_slice(&bytes.to_le_bytes());
            buf[REQ_PAYLOAD_OFFSET + 8..REQ_PAYLOAD_OFFSET + 12]
                .copy_from_slice(&u32::from(is_allocate).to_le_bytes());
        }
    }
    buf
}

/// Encode a response frame carrying the echoed request id.
pub fn encode_response(req_id: u32, response: &Response) -> [u8; RSP_MSG_LEN] {
    let mut buf = [0u8; RSP_MSG_LEN];
    buf[..4].copy_from_slice(&(response.kind() as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&req_id.to_le_bytes());
    match *response {
        Response::Quota { quota } => {
            buf[8..16].copy_from_slice(&quota.to_le_bytes());
        }
        Response::MemLimit { used, limit } => {
            buf[8..16].copy_from_slice(&used.to_le_bytes());
            buf[16..24].copy_from_slice(&limit.to_le_bytes());
        }
        Response::MemUpdate { verdict } => {
            buf[8..12].copy_from_slice(&u32::from(verdict).to_le_bytes());
        }
    }
    buf
}

/// Decode a response frame, returning the echoed request id and payload.
pub fn parse_response(buf: &[u8; RSP_MSG_LEN]) -> Result<(u32, Response), DecodeError> {
    let raw_kind = read_u32(buf, 0);
    let kind = RequestKind::from_wire(raw_kind).ok_or(DecodeError::UnknownKind(raw_kind))?;
    let req_id = read_u32(buf, 4);
    let response = match kind {
        RequestKind::Quota => Response::Quota {
            quota: read_f64(buf, 8),
        },
        RequestKind::MemLimit => Response::MemLimit {
            used: read_u64(buf, 8),
            limit: read_u64(buf, 16),
        },
        RequestKind::MemUpdate => Response::MemUpdate {
            verdict: read_u32(buf, 8) != 0,
        },
    };
    Ok((req_id, response))
}
