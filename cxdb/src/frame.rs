//! Binary frame codec.
//!
//! Every message on the wire is `len(u32) | msg_type(u16) | flags(u16) |
//! req_id(u64)` followed by `len` payload bytes, all little-endian.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CxdbError;

pub const MSG_HELLO: u16 = 1;
pub const MSG_CTX_CREATE: u16 = 2;
pub const MSG_CTX_FORK: u16 = 3;
pub const MSG_GET_HEAD: u16 = 4;
pub const MSG_APPEND: u16 = 5;
pub const MSG_PUT_BLOB: u16 = 11;
pub const MSG_ERROR: u16 = 255;

/// Frames above this size are a protocol violation on either side.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub req_id: u64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.req_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            len: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            msg_type: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            req_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// Read one frame, rejecting anything above [`MAX_FRAME_SIZE`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(FrameHeader, Vec<u8>), CxdbError> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    r.read_exact(&mut hdr_buf).await?;
    let header = FrameHeader::decode(&hdr_buf);
    if header.len > MAX_FRAME_SIZE {
        return Err(CxdbError::FrameTooLarge {
            len: header.len as u64,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut payload = vec![0u8; header.len as usize];
    r.read_exact(&mut payload).await?;
    Ok((header, payload))
}

/// Write a frame header followed by its payload.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg_type: u16,
    flags: u16,
    req_id: u64,
    payload: &[u8],
) -> Result<(), CxdbError> {
    let header = FrameHeader {
        len: payload.len() as u32,
        msg_type,
        flags,
        req_id,
    };
    w.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    Ok(())
}

/// Decode an error frame payload: `code(u32) | detail_len(u32) | detail`.
pub fn parse_error_frame(payload: &[u8]) -> CxdbError {
    if payload.len() < 8 {
        return CxdbError::Server {
            code: 0,
            detail: format!("short error payload len={}", payload.len()),
        };
    }
    let code = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let detail_len = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
    let detail = if detail_len > 0 && 8 + detail_len <= payload.len() {
        String::from_utf8_lossy(&payload[8..8 + detail_len]).into_owned()
    } else if payload.len() > 8 {
        String::from_utf8_lossy(&payload[8..]).into_owned()
    } else {
        String::new()
    };
    CxdbError::Server { code, detail }
}
