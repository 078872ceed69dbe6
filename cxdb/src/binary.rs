//! Binary protocol client.
//!
//! One TCP connection per client; a mutex serialises round trips so request
//! and response frames never interleave. Responses are matched by `req_id`;
//! a mismatch is fatal for the connection. Every round trip runs under a
//! deadline of `min(now + 30s, caller deadline)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::CxdbError;
use crate::frame::{
    parse_error_frame, read_frame, write_frame, FrameHeader, MSG_APPEND, MSG_CTX_CREATE,
    MSG_CTX_FORK, MSG_ERROR, MSG_GET_HEAD, MSG_HELLO, MSG_PUT_BLOB,
};

pub const BINARY_PROTOCOL_VERSION: u32 = 1;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(30);

/// Head information for a context, as returned by create/fork/get-head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextInfo {
    pub context_id: u64,
    pub head_turn_id: u64,
    pub head_depth: u32,
}

/// Acknowledgement for an append-turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendAck {
    pub context_id: u64,
    pub new_turn_id: u64,
    pub new_depth: u32,
    pub content_hash: [u8; 32],
}

#[derive(Debug)]
pub struct BinaryClient {
    addr: String,
    client_tag: String,
    conn: Mutex<Option<TcpStream>>,
    next_req_id: AtomicU64,

    session_id: u64,
    protocol_version: u32,
    server_tag: String,
}

impl BinaryClient {
    /// Dial `addr` and perform the HELLO handshake.
    ///
    /// The v1 framing (u32 lengths) is attempted first. With the
    /// `legacy-hello` feature enabled, a rejected v1 handshake triggers one
    /// legacy attempt on a fresh connection; there are no further fallbacks.
    pub async fn dial(addr: &str, client_tag: &str) -> Result<Self, CxdbError> {
        let addr = addr.trim().to_string();
        if addr.is_empty() {
            return Err(CxdbError::MissingAddr);
        }
        let client_tag = client_tag.trim().to_string();

        let stream = Self::connect(&addr).await?;
        let mut client = Self::new(addr.clone(), client_tag.clone(), stream);
        match client.hello_v1().await {
            Ok(()) => Ok(client),
            Err(v1_err) => {
                client.close().await;
                Self::dial_fallback(addr, client_tag, v1_err).await
            }
        }
    }

    #[cfg(feature = "legacy-hello")]
    async fn dial_fallback(
        addr: String,
        client_tag: String,
        v1_err: CxdbError,
    ) -> Result<Self, CxdbError> {
        let stream = match Self::connect(&addr).await {
            Ok(s) => s,
            Err(_) => return Err(v1_err),
        };
        let mut legacy = Self::new(addr, client_tag, stream);
        match legacy.hello_legacy().await {
            Ok(()) => Ok(legacy),
            Err(legacy_err) => {
                legacy.close().await;
                Err(CxdbError::HelloFailed(format!(
                    "v1={v1_err} legacy={legacy_err}"
                )))
            }
        }
    }

    #[cfg(not(feature = "legacy-hello"))]
    async fn dial_fallback(
        _addr: String,
        _client_tag: String,
        v1_err: CxdbError,
    ) -> Result<Self, CxdbError> {
        Err(CxdbError::HelloFailed(format!("v1={v1_err}")))
    }

    async fn connect(addr: &str) -> Result<TcpStream, CxdbError> {
        tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CxdbError::Timeout { op: "dial" })?
            .map_err(CxdbError::Io)
    }

    fn new(addr: String, client_tag: String, stream: TcpStream) -> Self {
        Self {
            addr,
            client_tag,
            conn: Mutex::new(Some(stream)),
            next_req_id: AtomicU64::new(0),
            session_id: 0,
            protocol_version: BINARY_PROTOCOL_VERSION,
            server_tag: String::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn server_tag(&self) -> &str {
        &self.server_tag
    }

    /// Drop the connection. Subsequent calls fail with `ConnectionClosed`.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        *guard = None;
    }

    pub async fn create_context(
        &self,
        base_turn_id: u64,
        deadline: Option<Instant>,
    ) -> Result<ContextInfo, CxdbError> {
        self.context_op("ctx_create", MSG_CTX_CREATE, base_turn_id, deadline)
            .await
    }

    pub async fn fork_context(
        &self,
        base_turn_id: u64,
        deadline: Option<Instant>,
    ) -> Result<ContextInfo, CxdbError> {
        self.context_op("ctx_fork", MSG_CTX_FORK, base_turn_id, deadline)
            .await
    }

    pub async fn get_head(
        &self,
        context_id: u64,
        deadline: Option<Instant>,
    ) -> Result<ContextInfo, CxdbError> {
        self.context_op("get_head", MSG_GET_HEAD, context_id, deadline)
            .await
    }

    async fn context_op(
        &self,
        op: &'static str,
        msg_type: u16,
        arg: u64,
        deadline: Option<Instant>,
    ) -> Result<ContextInfo, CxdbError> {
        let (resp_type, payload) = self
            .round_trip(op, msg_type, arg.to_le_bytes().to_vec(), deadline)
            .await?;
        if resp_type != msg_type {
            return Err(CxdbError::UnexpectedResponse {
                op,
                msg_type: resp_type,
            });
        }
        parse_context_info(op, &payload)
    }

    /// Append a turn. The payload is MsgPack-encoded (encoding=1,
    /// compression=0) and content-hashed with BLAKE3-256; the idempotency
    /// key includes `parent_turn_id` so identical payloads at different DAG
    /// positions do not collide.
    pub async fn append_turn(
        &self,
        context_id: u64,
        parent_turn_id: u64,
        type_id: &str,
        type_version: u32,
        payload: &serde_json::Value,
        deadline: Option<Instant>,
    ) -> Result<AppendAck, CxdbError> {
        let type_id = type_id.trim();
        if type_id.is_empty() || type_version == 0 {
            return Err(CxdbError::MissingDeclaredType);
        }

        let msgpack = rmp_serde::to_vec_named(payload)?;
        let sum: [u8; 32] = blake3::hash(&msgpack).into();
        let idem_key = format!(
            "kilroy:{parent_turn_id}:{type_id}:{type_version}:{}",
            hex::encode(sum)
        );

        let mut buf = Vec::with_capacity(64 + type_id.len() + msgpack.len() + idem_key.len());
        buf.extend_from_slice(&context_id.to_le_bytes());
        buf.extend_from_slice(&parent_turn_id.to_le_bytes());
        buf.extend_from_slice(&(type_id.len() as u32).to_le_bytes());
        buf.extend_from_slice(type_id.as_bytes());
        buf.extend_from_slice(&type_version.to_le_bytes());
        // encoding=1 (msgpack), compression=0 (none)
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(msgpack.len() as u32).to_le_bytes());
        buf.extend_from_slice(&sum);
        buf.extend_from_slice(&(msgpack.len() as u32).to_le_bytes());
        buf.extend_from_slice(&msgpack);
        buf.extend_from_slice(&(idem_key.len() as u32).to_le_bytes());
        buf.extend_from_slice(idem_key.as_bytes());

        let (resp_type, resp) = self
            .round_trip("append_turn", MSG_APPEND, buf, deadline)
            .await?;
        if resp_type != MSG_APPEND {
            return Err(CxdbError::UnexpectedResponse {
                op: "append_turn",
                msg_type: resp_type,
            });
        }
        parse_append_ack(&resp)
    }

    /// Upload raw bytes into the content-addressed blob store.
    ///
    /// The wire payload is `hash(32) || raw_len(u32) || raw_bytes`; the
    /// total must fit the u32 frame length. Returns whether the server
    /// stored a new blob (`true`) or already had it.
    pub async fn put_blob(
        &self,
        content_hash: [u8; 32],
        raw_len: u32,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        deadline: Option<Instant>,
    ) -> Result<bool, CxdbError> {
        let payload_len = 32u64 + 4 + raw_len as u64;
        if payload_len > u32::MAX as u64 {
            return Err(CxdbError::BlobTooLarge(payload_len));
        }

        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1;
        let budget = Self::budget(deadline);
        let mut guard = self.conn.lock().await;
        let stream = guard.as_mut().ok_or(CxdbError::ConnectionClosed)?;

        let io = async {
            let header = FrameHeader {
                len: payload_len as u32,
                msg_type: MSG_PUT_BLOB,
                flags: 0,
                req_id,
            };
            stream.write_all(&header.encode()).await?;
            stream.write_all(&content_hash).await?;
            stream.write_all(&raw_len.to_le_bytes()).await?;
            if raw_len > 0 {
                let mut limited = reader.take(raw_len as u64);
                let copied = tokio::io::copy(&mut limited, stream).await?;
                if copied != raw_len as u64 {
                    return Err(CxdbError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("blob source ended early: wrote {copied} of {raw_len}"),
                    )));
                }
            }
            stream.flush().await?;
            read_frame(stream).await
        };
        let timed = tokio::time::timeout(budget, io).await;
        let (header, resp) = match timed {
            Ok(res) => res?,
            Err(_) => {
                *guard = None;
                return Err(CxdbError::Timeout { op: "put_blob" });
            }
        };

        if header.req_id != req_id {
            *guard = None;
            return Err(CxdbError::ReqIdMismatch {
                got: header.req_id,
                want: req_id,
            });
        }
        if header.msg_type == MSG_ERROR {
            return Err(parse_error_frame(&resp));
        }
        if header.msg_type != MSG_PUT_BLOB {
            return Err(CxdbError::UnexpectedResponse {
                op: "put_blob",
                msg_type: header.msg_type,
            });
        }
        if resp.len() < 33 {
            return Err(CxdbError::ShortPayload {
                op: "put_blob ack",
                len: resp.len(),
            });
        }
        if resp[..32] != content_hash {
            return Err(CxdbError::BlobHashMismatch);
        }
        Ok(resp[32] == 1)
    }

    async fn hello_v1(&mut self) -> Result<(), CxdbError> {
        // protocol_version(u32) + client_tag_len(u32) + client_tag
        let mut payload = Vec::with_capacity(8 + self.client_tag.len());
        payload.extend_from_slice(&BINARY_PROTOCOL_VERSION.to_le_bytes());
        payload.extend_from_slice(&(self.client_tag.len() as u32).to_le_bytes());
        payload.extend_from_slice(self.client_tag.as_bytes());

        let (resp_type, resp) = self.round_trip("hello", MSG_HELLO, payload, None).await?;
        if resp_type != MSG_HELLO {
            return Err(CxdbError::UnexpectedResponse {
                op: "hello",
                msg_type: resp_type,
            });
        }
        // protocol_version(u32) + session_id(u64) + server_tag_len(u32) + server_tag
        if resp.len() < 16 {
            return Err(CxdbError::ShortPayload {
                op: "hello",
                len: resp.len(),
            });
        }
        self.protocol_version = u32::from_le_bytes(resp[0..4].try_into().unwrap());
        self.session_id = u64::from_le_bytes(resp[4..12].try_into().unwrap());
        let tag_len = u32::from_le_bytes(resp[12..16].try_into().unwrap()) as usize;
        if tag_len > 0 && 16 + tag_len <= resp.len() {
            self.server_tag = String::from_utf8_lossy(&resp[16..16 + tag_len]).into_owned();
        }
        Ok(())
    }

    #[cfg(feature = "legacy-hello")]
    async fn hello_legacy(&mut self) -> Result<(), CxdbError> {
        // protocol_version(u16) + client_tag_len(u16) + client_tag + meta_json_len(u32)=0
        let mut payload = Vec::with_capacity(8 + self.client_tag.len());
        payload.extend_from_slice(&(BINARY_PROTOCOL_VERSION as u16).to_le_bytes());
        payload.extend_from_slice(&(self.client_tag.len() as u16).to_le_bytes());
        payload.extend_from_slice(self.client_tag.as_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());

        let (resp_type, resp) = self.round_trip("hello", MSG_HELLO, payload, None).await?;
        if resp_type != MSG_HELLO {
            return Err(CxdbError::UnexpectedResponse {
                op: "hello (legacy)",
                msg_type: resp_type,
            });
        }
        // session_id(u64) + protocol_version(u16)
        if resp.len() < 10 {
            return Err(CxdbError::ShortPayload {
                op: "hello (legacy)",
                len: resp.len(),
            });
        }
        self.session_id = u64::from_le_bytes(resp[0..8].try_into().unwrap());
        self.protocol_version = u16::from_le_bytes(resp[8..10].try_into().unwrap()) as u32;
        Ok(())
    }

    fn budget(deadline: Option<Instant>) -> Duration {
        let default = ROUND_TRIP_TIMEOUT;
        match deadline {
            Some(dl) => dl.saturating_duration_since(Instant::now()).min(default),
            None => default,
        }
    }

    async fn round_trip(
        &self,
        op: &'static str,
        msg_type: u16,
        payload: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<(u16, Vec<u8>), CxdbError> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1;
        let budget = Self::budget(deadline);
        let mut guard = self.conn.lock().await;
        let stream = guard.as_mut().ok_or(CxdbError::ConnectionClosed)?;

        let io = async {
            write_frame(stream, msg_type, 0, req_id, &payload).await?;
            stream.flush().await?;
            read_frame(stream).await
        };
        let timed = tokio::time::timeout(budget, io).await;
        let (header, resp) = match timed {
            Ok(res) => res?,
            Err(_) => {
                // The response may arrive later and would desync req ids.
                tracing::warn!(op, req_id, "round trip timed out; dropping connection");
                *guard = None;
                return Err(CxdbError::Timeout { op });
            }
        };

        if header.req_id != req_id {
            *guard = None;
            return Err(CxdbError::ReqIdMismatch {
                got: header.req_id,
                want: req_id,
            });
        }
        if header.msg_type == MSG_ERROR {
            return Err(parse_error_frame(&resp));
        }
        Ok((header.msg_type, resp))
    }
}

fn parse_context_info(op: &'static str, payload: &[u8]) -> Result<ContextInfo, CxdbError> {
    if payload.len() < 20 {
        return Err(CxdbError::ShortPayload {
            op,
            len: payload.len(),
        });
    }
    Ok(ContextInfo {
        context_id: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
        head_turn_id: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
        head_depth: u32::from_le_bytes(payload[16..20].try_into().unwrap()),
    })
}

fn parse_append_ack(payload: &[u8]) -> Result<AppendAck, CxdbError> {
    if payload.len() < 52 {
        return Err(CxdbError::ShortPayload {
            op: "append ack",
            len: payload.len(),
        });
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&payload[20..52]);
    Ok(AppendAck {
        context_id: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
        new_turn_id: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
        new_depth: u32::from_le_bytes(payload[16..20].try_into().unwrap()),
        content_hash: hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_context_info_short() {
        let err = parse_context_info("ctx_create", &[0u8; 19]).unwrap_err();
        assert!(matches!(err, CxdbError::ShortPayload { .. }));
    }

    #[test]
    fn parse_append_ack_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u64.to_le_bytes());
        payload.extend_from_slice(&9u64.to_le_bytes());
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&[0xab; 32]);
        let ack = parse_append_ack(&payload).unwrap();
        assert_eq!(ack.context_id, 3);
        assert_eq!(ack.new_turn_id, 9);
        assert_eq!(ack.new_depth, 2);
        assert_eq!(ack.content_hash, [0xab; 32]);
    }

    #[test]
    fn budget_clamps_to_round_trip_timeout() {
        let far = Instant::now() + Duration::from_secs(3600);
        assert_eq!(BinaryClient::budget(Some(far)), ROUND_TRIP_TIMEOUT);
        let near = Instant::now() + Duration::from_millis(50);
        assert!(BinaryClient::budget(Some(near)) <= Duration::from_millis(50));
    }
}
