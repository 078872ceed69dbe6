//! HTTP JSON client.
//!
//! Covers the JSON surface of CXDB: context create/fork, turn append,
//! bundle registry, blob fetch, and the health probe. Identifiers are
//! opaque strings on this surface (the binary protocol uses u64s).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CxdbError;

#[derive(Debug, Clone, Deserialize)]
pub struct HttpContextInfo {
    pub context_id: String,
    #[serde(default)]
    pub head_turn_id: String,
    #[serde(default)]
    pub head_depth: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppendTurnRequest {
    pub type_id: String,
    pub type_version: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_turn_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppendTurnResponse {
    pub context_id: String,
    pub turn_id: String,
    #[serde(default)]
    pub depth: u64,
    #[serde(default)]
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /health; any 2xx counts as healthy.
    pub async fn health(&self) -> Result<(), CxdbError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        check_status("health", resp).await.map(|_| ())
    }

    pub async fn create_context(&self, base_turn_id: &str) -> Result<HttpContextInfo, CxdbError> {
        self.context_request("create", base_turn_id).await
    }

    /// Create a new context starting at an existing head.
    pub async fn fork_context(&self, base_turn_id: &str) -> Result<HttpContextInfo, CxdbError> {
        self.context_request("fork", base_turn_id).await
    }

    async fn context_request(
        &self,
        verb: &'static str,
        base_turn_id: &str,
    ) -> Result<HttpContextInfo, CxdbError> {
        let resp = self
            .http
            .post(format!("{}/v1/contexts/{verb}", self.base_url))
            .json(&serde_json::json!({ "base_turn_id": base_turn_id }))
            .send()
            .await?;
        let resp = check_status("contexts", resp).await?;
        Ok(resp.json().await?)
    }

    pub async fn append_turn(
        &self,
        context_id: &str,
        req: &AppendTurnRequest,
    ) -> Result<AppendTurnResponse, CxdbError> {
        let resp = self
            .http
            .post(format!("{}/v1/contexts/{context_id}/append", self.base_url))
            .json(req)
            .send()
            .await?;
        let resp = check_status("append", resp).await?;
        Ok(resp.json().await?)
    }

    /// PUT /v1/registry/bundles/{id} with arbitrary bundle metadata.
    pub async fn put_bundle(&self, bundle_id: &str, body: &Value) -> Result<(), CxdbError> {
        let resp = self
            .http
            .put(format!("{}/v1/registry/bundles/{bundle_id}", self.base_url))
            .json(body)
            .send()
            .await?;
        check_status("put_bundle", resp).await.map(|_| ())
    }

    /// Fetch raw blob bytes by hex content hash.
    pub async fn get_blob(&self, content_hash_hex: &str) -> Result<Vec<u8>, CxdbError> {
        let resp = self
            .http
            .get(format!("{}/v1/blobs/{content_hash_hex}", self.base_url))
            .send()
            .await?;
        let resp = check_status("get_blob", resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

async fn check_status(
    op: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, CxdbError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body = body.chars().take(2048).collect::<String>();
    Err(CxdbError::HttpStatus {
        op,
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}
