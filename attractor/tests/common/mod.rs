//! In-process CXDB stand-in for integration tests: the JSON surface on an
//! axum server and a minimal binary listener (HELLO + PUT_BLOB).
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub turn_id: String,
    pub parent_turn_id: String,
    pub depth: u64,
    pub type_id: String,
    pub data: Value,
}

#[derive(Default)]
struct ContextState {
    head_turn_id: String,
    head_depth: u64,
    turns: Vec<TurnRecord>,
    idempotency: HashMap<String, Value>,
}

#[derive(Default)]
pub struct CxdbTestServer {
    next_context_id: AtomicU64,
    next_turn_id: AtomicU64,
    next_session_id: AtomicU64,
    contexts: Mutex<HashMap<String, ContextState>>,
    bundles: Mutex<HashMap<String, Value>>,
    blobs: Mutex<HashMap<[u8; 32], Vec<u8>>>,
}

pub struct CxdbHandle {
    pub server: Arc<CxdbTestServer>,
    pub http_base_url: String,
    pub binary_addr: String,
}

impl CxdbTestServer {
    fn create_context(&self, base_turn_id: String) -> Value {
        let id = (self.next_context_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let mut contexts = self.contexts.lock().unwrap();
        contexts.insert(
            id.clone(),
            ContextState {
                head_turn_id: base_turn_id.clone(),
                ..ContextState::default()
            },
        );
        json!({"context_id": id, "head_turn_id": base_turn_id, "head_depth": 0})
    }

    pub fn turns(&self, context_id: &str) -> Vec<TurnRecord> {
        self.contexts
            .lock()
            .unwrap()
            .get(context_id)
            .map(|c| c.turns.clone())
            .unwrap_or_default()
    }

    pub fn context_ids(&self) -> Vec<String> {
        self.contexts.lock().unwrap().keys().cloned().collect()
    }

    pub fn bundle(&self, id: &str) -> Option<Value> {
        self.bundles.lock().unwrap().get(id).cloned()
    }

    pub fn blob(&self, hash: &[u8; 32]) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(hash).cloned()
    }
}

async fn handle_create(State(srv): State<Arc<CxdbTestServer>>, body: Json<Value>) -> Json<Value> {
    let base = body
        .get("base_turn_id")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("0")
        .to_string();
    Json(srv.create_context(base))
}

async fn handle_append(
    State(srv): State<Arc<CxdbTestServer>>,
    Path(ctx_id): Path<String>,
    body: Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let type_id = body
        .get("type_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let parent = body
        .get("parent_turn_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let idem_key = body
        .get("idempotency_key")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let data = body.get("data").cloned().unwrap_or_else(|| json!({}));

    let mut contexts = srv.contexts.lock().unwrap();
    let ctx = contexts.get_mut(&ctx_id).ok_or(StatusCode::NOT_FOUND)?;
    if !idem_key.is_empty() {
        if let Some(resp) = ctx.idempotency.get(&idem_key) {
            return Ok(Json(resp.clone()));
        }
    }
    let turn_id = (srv.next_turn_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
    ctx.head_depth += 1;
    ctx.head_turn_id = turn_id.clone();
    ctx.turns.push(TurnRecord {
        turn_id: turn_id.clone(),
        parent_turn_id: parent,
        depth: ctx.head_depth,
        type_id,
        data,
    });
    let resp = json!({
        "context_id": ctx_id,
        "turn_id": turn_id,
        "depth": ctx.head_depth,
        "content_hash": format!("h{turn_id}"),
    });
    if !idem_key.is_empty() {
        ctx.idempotency.insert(idem_key, resp.clone());
    }
    Ok(Json(resp))
}

async fn handle_bundle(
    State(srv): State<Arc<CxdbTestServer>>,
    Path(id): Path<String>,
    body: Json<Value>,
) -> StatusCode {
    srv.bundles.lock().unwrap().insert(id, body.0);
    StatusCode::CREATED
}

pub async fn spawn_cxdb() -> CxdbHandle {
    let server = Arc::new(CxdbTestServer::default());

    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/v1/contexts/create", post(handle_create))
        .route("/v1/contexts/fork", post(handle_create))
        .route("/v1/contexts/{id}/append", post(handle_append))
        .route("/v1/registry/bundles/{id}", put(handle_bundle))
        .with_state(server.clone());

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(http_listener, app).await;
    });

    let bin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bin_addr = bin_listener.local_addr().unwrap();
    {
        let server = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = bin_listener.accept().await else {
                    return;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = serve_binary(conn, server).await;
                });
            }
        });
    }

    CxdbHandle {
        server,
        http_base_url: format!("http://{http_addr}"),
        binary_addr: bin_addr.to_string(),
    }
}

async fn serve_binary(
    mut conn: tokio::net::TcpStream,
    srv: Arc<CxdbTestServer>,
) -> std::io::Result<()> {
    loop {
        let mut hdr = [0u8; 16];
        conn.read_exact(&mut hdr).await?;
        let len = u32::from_le_bytes(hdr[0..4].try_into().unwrap()) as usize;
        let msg_type = u16::from_le_bytes(hdr[4..6].try_into().unwrap());
        let req_id = u64::from_le_bytes(hdr[8..16].try_into().unwrap());
        let mut payload = vec![0u8; len];
        conn.read_exact(&mut payload).await?;

        match msg_type {
            1 => {
                let session = srv.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
                let tag = b"cxdb-test";
                let mut resp = Vec::new();
                resp.extend_from_slice(&1u32.to_le_bytes());
                resp.extend_from_slice(&session.to_le_bytes());
                resp.extend_from_slice(&(tag.len() as u32).to_le_bytes());
                resp.extend_from_slice(tag);
                write_bin_frame(&mut conn, 1, req_id, &resp).await?;
            }
            11 => {
                let mut want = [0u8; 32];
                want.copy_from_slice(&payload[0..32]);
                let raw = &payload[36..];
                if <[u8; 32]>::from(blake3::hash(raw)) != want {
                    write_bin_error(&mut conn, req_id, 409, "put_blob: hash mismatch").await?;
                    continue;
                }
                let existed = {
                    let mut blobs = srv.blobs.lock().unwrap();
                    let existed = blobs.contains_key(&want);
                    if !existed {
                        blobs.insert(want, raw.to_vec());
                    }
                    existed
                };
                let mut resp = Vec::with_capacity(33);
                resp.extend_from_slice(&want);
                resp.push(if existed { 0 } else { 1 });
                write_bin_frame(&mut conn, 11, req_id, &resp).await?;
            }
            other => {
                write_bin_error(&mut conn, req_id, 400, &format!("unsupported msg_type={other}"))
                    .await?;
            }
        }
    }
}

async fn write_bin_frame(
    conn: &mut tokio::net::TcpStream,
    msg_type: u16,
    req_id: u64,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut hdr = [0u8; 16];
    hdr[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    hdr[4..6].copy_from_slice(&msg_type.to_le_bytes());
    hdr[8..16].copy_from_slice(&req_id.to_le_bytes());
    conn.write_all(&hdr).await?;
    conn.write_all(payload).await
}

async fn write_bin_error(
    conn: &mut tokio::net::TcpStream,
    req_id: u64,
    code: u32,
    detail: &str,
) -> std::io::Result<()> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&code.to_le_bytes());
    payload.extend_from_slice(&(detail.len() as u32).to_le_bytes());
    payload.extend_from_slice(detail.as_bytes());
    write_bin_frame(conn, 255, req_id, &payload).await
}

/// Minimal run config pointing at the mock server, with a pinned catalog.
pub fn test_config(handle: &CxdbHandle, pinned_catalog: &std::path::Path) -> attractor::config::RunConfig {
    let mut cfg = attractor::config::RunConfig::default();
    cfg.version = 1;
    cfg.cxdb.binary_addr = handle.binary_addr.clone();
    cfg.cxdb.http_base_url = handle.http_base_url.clone();
    cfg.modeldb.catalog_path = pinned_catalog.to_path_buf();
    cfg.modeldb.catalog_update_policy = "pinned".into();
    cfg
}

pub fn write_pinned_catalog(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("pinned_catalog.json");
    std::fs::write(&path, r#"{"data":[{"id":"openai/gpt-5"}]}"#).unwrap();
    path
}
