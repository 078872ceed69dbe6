//! CXDB event sink.
//!
//! Appends normalized engine events to a CXDB context over the HTTP API and
//! stores large artifacts in the blob CAS via the binary protocol. Appends
//! are serialized behind a mutex so the in-memory head stays the monotonic
//! chain head: `parent_turn_id` defaults to the current head and advances
//! to the server-assigned turn id on success.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::error::EngineError;

pub const ARTIFACT_TYPE_ID: &str = "com.kilroy.attractor.Artifact";
pub const RUN_STARTED_TYPE_ID: &str = "com.kilroy.attractor.RunStarted";
pub const RUN_FINISHED_TYPE_ID: &str = "com.kilroy.attractor.RunFinished";
pub const NODE_EXECUTION_TYPE_ID: &str = "com.kilroy.attractor.NodeExecution";

/// PUT_BLOB framing overhead: hash(32) + raw_len(4).
const PUT_BLOB_OVERHEAD: u64 = 32 + 4;

pub struct CxdbSink {
    http: cxdb::Client,
    binary: Arc<cxdb::BinaryClient>,
    run_id: String,
    bundle_id: String,
    context_id: String,
    head: Mutex<String>,
}

impl CxdbSink {
    pub fn new(
        http: cxdb::Client,
        binary: Arc<cxdb::BinaryClient>,
        run_id: impl Into<String>,
        context_id: impl Into<String>,
        head_turn_id: impl Into<String>,
        bundle_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            binary,
            run_id: run_id.into(),
            bundle_id: bundle_id.into(),
            context_id: context_id.into(),
            head: Mutex::new(head_turn_id.into()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub async fn head_turn_id(&self) -> String {
        self.head.lock().await.clone()
    }

    /// Append a turn whose parent is the current head; returns
    /// `(turn_id, content_hash)`.
    pub async fn append(
        &self,
        type_id: &str,
        type_version: u32,
        data: Map<String, Value>,
    ) -> Result<(String, String), EngineError> {
        self.append_with_key(type_id, type_version, data, String::new())
            .await
    }

    async fn append_with_key(
        &self,
        type_id: &str,
        type_version: u32,
        data: Map<String, Value>,
        idempotency_key: String,
    ) -> Result<(String, String), EngineError> {
        let mut head = self.head.lock().await;
        let req = cxdb::AppendTurnRequest {
            type_id: type_id.to_string(),
            type_version,
            parent_turn_id: head.clone(),
            idempotency_key,
            data: Value::Object(data),
        };
        let resp = self.http.append_turn(&self.context_id, &req).await?;
        *head = resp.turn_id.clone();
        Ok((resp.turn_id, resp.content_hash))
    }

    /// Create a new context based at the current head (`"0"` when the
    /// context is empty) and return an independent sink sharing the
    /// clients.
    pub async fn fork_from_head(&self) -> Result<CxdbSink, EngineError> {
        let base = {
            let head = self.head.lock().await;
            if head.trim().is_empty() {
                "0".to_string()
            } else {
                head.clone()
            }
        };
        let ci = self.http.fork_context(&base).await?;
        Ok(CxdbSink::new(
            self.http.clone(),
            self.binary.clone(),
            self.run_id.clone(),
            ci.context_id,
            ci.head_turn_id,
            self.bundle_id.clone(),
        ))
    }

    /// Store a file in the blob CAS and record an artifact turn pointing at
    /// it.
    ///
    /// The file is hashed with BLAKE3-256; the byte count read must match
    /// the stat size exactly, and the raw length must fit the PUT_BLOB u32
    /// frame budget. Returns the artifact turn id.
    pub async fn put_artifact_file(
        &self,
        node_id: &str,
        logical_name: &str,
        path: &Path,
    ) -> Result<String, EngineError> {
        let meta = tokio::fs::metadata(path).await?;
        let raw_len = meta.len();
        let max_blob_len = u32::MAX as u64 - PUT_BLOB_OVERHEAD;
        if raw_len > max_blob_len {
            return Err(EngineError::Invariant(format!(
                "artifact too large for binary protocol (u32 frame len): {} size={raw_len}",
                path.display()
            )));
        }

        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = blake3::Hasher::new();
        let mut read_total: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            read_total += n as u64;
        }
        if read_total != raw_len {
            // PUT_BLOB must stream exactly raw_len bytes.
            return Err(EngineError::Invariant(format!(
                "artifact read: size mismatch: stat={raw_len} read={read_total} path={}",
                path.display()
            )));
        }
        let sum: [u8; 32] = hasher.finalize().into();

        let mut file = tokio::fs::File::open(path).await?;
        self.binary
            .put_blob(sum, raw_len as u32, &mut file, None)
            .await?;
        let blob_hash_hex = hex::encode(sum);

        let mime = mime_for_path(path);
        let idem_key = format!(
            "kilroy:artifact:{}:{node_id}:{logical_name}:{blob_hash_hex}",
            self.run_id
        );
        let mut data = Map::new();
        data.insert("run_id".into(), Value::String(self.run_id.clone()));
        data.insert("node_id".into(), Value::String(node_id.to_string()));
        data.insert("name".into(), Value::String(logical_name.to_string()));
        data.insert("mime".into(), Value::String(mime.to_string()));
        data.insert("content_hash".into(), Value::String(blob_hash_hex));
        data.insert("bytes_len".into(), Value::from(raw_len));
        data.insert(
            "local_path".into(),
            Value::String(path.to_string_lossy().into_owned()),
        );
        let (turn_id, _) = self
            .append_with_key(ARTIFACT_TYPE_ID, 1, data, idem_key)
            .await?;
        Ok(turn_id)
    }
}

/// MIME type by extension, defaulting to a byte stream.
pub fn mime_for_path(path: &Path) -> &'static str {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return "application/gzip";
    }
    if name.ends_with(".md") {
        return "text/markdown";
    }
    if name.ends_with(".ndjson") {
        return "application/x-ndjson";
    }
    if name.ends_with(".json") {
        return "application/json";
    }
    "application/octet-stream"
}
