//! Binary wire format for chunk uploads.
//!
//! One recording chunk per request body, so media payloads never pass
//! through JSON or base64.
//!
//! ## Wire Format
//!
//! ```text
//! [Header: 38 bytes] [session_id bytes] [payload bytes]
//! ```
//!
//! ### Header (38 bytes, little-endian)
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic: 0x4B4E4843 ("CHNK") |
//! | 4 | 2 | Version: 1 |
//! | 6 | 1 | Device role code |
//! | 7 | 1 | Stream kind code |
//! | 8 | 8 | sequence (u64) |
//! | 16 | 8 | started_at_ms (i64) |
//! | 24 | 4 | duration_ms (u32) |
//! | 28 | 2 | session_id_len (u16) |
//! | 30 | 4 | payload_len (u32) |
//! | 34 | 4 | CRC32 checksum (of all data after header) |

use bytes::Bytes;
use thiserror::Error;

use crate::types::{DeviceRole, RecordingChunk, StreamKind, UploadStatus};

/// Magic number: "CHNK" in ASCII (little-endian)
pub const MAGIC: u32 = 0x4B4E4843;

/// Protocol version
pub const VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 38;

/// Content-Type header value for this format
pub const CONTENT_TYPE: &str = "application/x-proctor-chunk";

/// Decoded chunk frame
#[derive(Debug, Clone, PartialEq)]
pub struct WireChunk {
    pub session_id: String,
    pub device_role: DeviceRole,
    pub kind: StreamKind,
    pub sequence: u64,
    pub started_at_ms: i64,
    pub duration_ms: u32,
    pub checksum: u32,
    pub payload: Bytes,
}

impl WireChunk {
    pub fn from_chunk(chunk: &RecordingChunk) -> Self {
        Self {
            session_id: chunk.session_id.clone(),
            device_role: chunk.device_role,
            kind: chunk.kind,
            sequence: chunk.sequence,
            started_at_ms: chunk.started_at_ms,
            duration_ms: chunk.duration_ms,
            checksum: crc32fast::hash(&chunk.payload),
            payload: chunk.payload.clone(),
        }
    }

    pub fn into_chunk(self) -> RecordingChunk {
        RecordingChunk {
            session_id: self.session_id,
            device_role: self.device_role,
            kind: self.kind,
            sequence: self.sequence,
            started_at_ms: self.started_at_ms,
            duration_ms: self.duration_ms,
            payload: self.payload,
            status: UploadStatus::Pending,
        }
    }
}

/// Why an upload body could not be decoded
#[derive(Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("bad magic 0x{got:08X} (want 0x{expected:08X})")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("wire version {got} not understood (this build speaks {expected})")]
    UnsupportedVersion { expected: u16, got: u16 },

    #[error("body of {got} bytes is shorter than the {expected}-byte header")]
    TruncatedHeader { expected: usize, got: usize },

    #[error("body declares {declared} bytes after the header, but {available} are present")]
    LengthMismatch { declared: usize, available: usize },

    #[error("unknown {field} code {code}")]
    UnknownCode { field: &'static str, code: u8 },

    #[error("session id is not valid UTF-8")]
    InvalidSessionId,

    #[error("payload CRC32 0x{computed:08X} does not match header 0x{expected:08X}")]
    ChecksumMismatch { expected: u32, computed: u32 },
}

fn role_code(role: DeviceRole) -> u8 {
    match role {
        DeviceRole::Primary => 1,
        DeviceRole::Secondary => 2,
        DeviceRole::Reviewer => 3,
    }
}

fn role_from_code(code: u8) -> Option<DeviceRole> {
    match code {
        1 => Some(DeviceRole::Primary),
        2 => Some(DeviceRole::Secondary),
        3 => Some(DeviceRole::Reviewer),
        _ => None,
    }
}

/// Encode a chunk to the binary wire format.
///
/// The CRC32 covers the session id and payload (everything after the header).
pub fn encode_chunk(chunk: &RecordingChunk) -> Vec<u8> {
    let session = chunk.session_id.as_bytes();
    let mut buf = Vec::with_capacity(HEADER_SIZE + session.len() + chunk.payload.len());

    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.push(role_code(chunk.device_role));
    buf.push(chunk.kind.code());
    buf.extend_from_slice(&chunk.sequence.to_le_bytes());
    buf.extend_from_slice(&chunk.started_at_ms.to_le_bytes());
    buf.extend_from_slice(&chunk.duration_ms.to_le_bytes());
    buf.extend_from_slice(&(session.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(chunk.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // CRC32 placeholder

    buf.extend_from_slice(session);
    buf.extend_from_slice(&chunk.payload);

    let crc = crc32fast::hash(&buf[HEADER_SIZE..]);
    buf[34..38].copy_from_slice(&crc.to_le_bytes());

    buf
}

/// Decode a chunk from the binary wire format.
///
/// Validates magic number, version, lengths and CRC32 checksum. The returned
/// `checksum` is the CRC32 of the payload alone, which is what the server stores.
pub fn decode_chunk(data: &[u8]) -> Result<WireChunk, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::TruncatedHeader {
            expected: HEADER_SIZE,
            got: data.len(),
        });
    }

    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if magic != MAGIC {
        return Err(DecodeError::InvalidMagic {
            expected: MAGIC,
            got: magic,
        });
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion {
            expected: VERSION,
            got: version,
        });
    }

    let device_role = role_from_code(data[6]).ok_or(DecodeError::UnknownCode {
        field: "device role",
        code: data[6],
    })?;
    let kind = StreamKind::from_code(data[7]).ok_or(DecodeError::UnknownCode {
        field: "stream kind",
        code: data[7],
    })?;

    let mut u64_buf = [0u8; 8];
    u64_buf.copy_from_slice(&data[8..16]);
    let sequence = u64::from_le_bytes(u64_buf);
    u64_buf.copy_from_slice(&data[16..24]);
    let started_at_ms = i64::from_le_bytes(u64_buf);
    let duration_ms = u32::from_le_bytes([data[24], data[25], data[26], data[27]]);
    let session_len = u16::from_le_bytes([data[28], data[29]]) as usize;
    let payload_len = u32::from_le_bytes([data[30], data[31], data[32], data[33]]) as usize;
    let expected_crc = u32::from_le_bytes([data[34], data[35], data[36], data[37]]);

    let available = data.len() - HEADER_SIZE;
    if session_len + payload_len != available {
        return Err(DecodeError::LengthMismatch {
            declared: session_len + payload_len,
            available,
        });
    }

    let computed_crc = crc32fast::hash(&data[HEADER_SIZE..]);
    if computed_crc != expected_crc {
        return Err(DecodeError::ChecksumMismatch {
            expected: expected_crc,
            computed: computed_crc,
        });
    }

    let session_end = HEADER_SIZE + session_len;
    let session_id = std::str::from_utf8(&data[HEADER_SIZE..session_end])
        .map_err(|_| DecodeError::InvalidSessionId)?
        .to_string();
    let payload = Bytes::copy_from_slice(&data[session_end..]);

    Ok(WireChunk {
        session_id,
        device_role,
        kind,
        sequence,
        started_at_ms,
        duration_ms,
        checksum: crc32fast::hash(&payload),
        payload,
    })
}
