use miette::Diagnostic;
use thiserror::Error;

/// Errors surfaced by the CXDB clients.
///
/// Protocol violations (bad framing, mismatched request ids, oversized
/// frames) are terminal for the connection; server errors carry the code
/// and detail reported by CXDB and may be retried by the caller where the
/// operation is idempotent.
#[derive(Debug, Error, Diagnostic)]
pub enum CxdbError {
    #[error("cxdb binary addr is required")]
    #[diagnostic(code(cxdb::missing_addr))]
    MissingAddr,

    #[error("cxdb binary connection is closed")]
    #[diagnostic(code(cxdb::connection_closed))]
    ConnectionClosed,

    #[error("cxdb frame too large: {len} > {max}")]
    #[diagnostic(
        code(cxdb::frame_too_large),
        help("Frames are capped at 64 MiB; store oversized payloads as blobs.")
    )]
    FrameTooLarge { len: u64, max: u32 },

    #[error("cxdb: response req_id mismatch: got={got} want={want}")]
    #[diagnostic(code(cxdb::req_id_mismatch))]
    ReqIdMismatch { got: u64, want: u64 },

    #[error("cxdb {op}: unexpected response type={msg_type}")]
    #[diagnostic(code(cxdb::unexpected_response))]
    UnexpectedResponse { op: &'static str, msg_type: u16 },

    #[error("cxdb {op}: short payload len={len}")]
    #[diagnostic(code(cxdb::short_payload))]
    ShortPayload { op: &'static str, len: usize },

    #[error("cxdb binary error: code={code}{}", detail_suffix(.detail))]
    #[diagnostic(code(cxdb::server))]
    Server { code: u32, detail: String },

    #[error("cxdb hello failed: {0}")]
    #[diagnostic(
        code(cxdb::hello),
        help("The server rejected every supported HELLO framing; check protocol versions.")
    )]
    HelloFailed(String),

    #[error("cxdb put_blob: payload too large: {0}")]
    #[diagnostic(code(cxdb::blob_too_large))]
    BlobTooLarge(u64),

    #[error("cxdb put_blob ack: hash mismatch")]
    #[diagnostic(code(cxdb::blob_hash_mismatch))]
    BlobHashMismatch,

    #[error("declared type id+version are required")]
    #[diagnostic(code(cxdb::missing_declared_type))]
    MissingDeclaredType,

    #[error("cxdb {op} timed out")]
    #[diagnostic(code(cxdb::timeout))]
    Timeout { op: &'static str },

    #[error("cxdb http {op}: status={status} body={body}")]
    #[diagnostic(code(cxdb::http_status))]
    HttpStatus {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error(transparent)]
    #[diagnostic(code(cxdb::http_transport))]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    #[diagnostic(code(cxdb::io))]
    Io(#[from] std::io::Error),

    #[error("msgpack encode: {0}")]
    #[diagnostic(code(cxdb::msgpack))]
    Msgpack(#[from] rmp_serde::encode::Error),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(" detail={detail}")
    }
}
