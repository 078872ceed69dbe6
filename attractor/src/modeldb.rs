//! Model-catalog snapshotting.
//!
//! Each run pins the model catalog it executed against by copying (or
//! fetching) it into `<logs_root>/modeldb/openrouter_models.json`, so a
//! run's model resolution stays reproducible after the upstream catalog
//! moves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::EngineError;

pub const DEFAULT_CATALOG_URL: &str = "https://openrouter.ai/api/v1/models";
pub const CATALOG_SNAPSHOT_DIR: &str = "modeldb";
pub const CATALOG_SNAPSHOT_FILE: &str = "openrouter_models.json";
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatalogPolicy {
    /// Copy the pinned file, never fetch.
    Pinned,
    /// Fetch the live catalog at run start; fall back to pinned on failure.
    #[default]
    OnRunStart,
}

impl CatalogPolicy {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw.trim() {
            "" | "on_run_start" => Ok(CatalogPolicy::OnRunStart),
            "pinned" => Ok(CatalogPolicy::Pinned),
            other => Err(EngineError::Config(format!(
                "invalid catalog update policy: {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedCatalog {
    pub snapshot_path: PathBuf,
    /// Where the effective bytes came from: the fetch URL or the pinned path.
    pub source: String,
    pub sha256: String,
    pub warning: Option<String>,
}

/// Snapshot the effective model catalog under the logs root.
///
/// Policy `pinned` copies the pinned file. Policy `on_run_start` fetches
/// `url` with `timeout`; on failure it warns and copies pinned, and when
/// the fetched bytes differ from the pinned snapshot the warning embeds
/// both digests.
pub async fn resolve_model_catalog(
    pinned_path: &Path,
    logs_root: &Path,
    policy: CatalogPolicy,
    url: Option<&str>,
    timeout: Option<Duration>,
) -> Result<ResolvedCatalog, EngineError> {
    if pinned_path.as_os_str().is_empty() {
        return Err(EngineError::Config("pinned catalog path is required".into()));
    }
    if logs_root.as_os_str().is_empty() {
        return Err(EngineError::Config("logs root is required".into()));
    }
    let timeout = timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT);
    let url = match url.map(str::trim) {
        Some(u) if !u.is_empty() => u,
        _ => DEFAULT_CATALOG_URL,
    };

    let dst_dir = logs_root.join(CATALOG_SNAPSHOT_DIR);
    std::fs::create_dir_all(&dst_dir)?;
    let dst_path = dst_dir.join(CATALOG_SNAPSHOT_FILE);

    let pinned_sha = std::fs::read(pinned_path)
        .ok()
        .map(|b| hex::encode(Sha256::digest(&b)));

    let mut source = pinned_path.to_string_lossy().into_owned();
    let mut warning = None;

    match policy {
        CatalogPolicy::Pinned => {
            std::fs::copy(pinned_path, &dst_path)?;
        }
        CatalogPolicy::OnRunStart => match fetch_bytes(url, timeout).await {
            Ok(body) if !body.is_empty() => {
                std::fs::write(&dst_path, &body)?;
                source = url.to_string();
            }
            Ok(_) => {
                warning = Some(
                    "modeldb: fetch failed (empty response body); falling back to pinned snapshot"
                        .to_string(),
                );
                std::fs::copy(pinned_path, &dst_path)?;
            }
            Err(e) => {
                warning = Some(format!(
                    "modeldb: fetch failed ({e}); falling back to pinned snapshot"
                ));
                std::fs::copy(pinned_path, &dst_path)?;
            }
        },
    }

    let effective = std::fs::read(&dst_path)?;
    let sha256 = hex::encode(Sha256::digest(&effective));
    if warning.is_none() && policy == CatalogPolicy::OnRunStart {
        if let Some(pinned_sha) = pinned_sha {
            if pinned_sha != sha256 {
                warning = Some(format!(
                    "modeldb: effective catalog differs from pinned snapshot \
                     (pinned_sha256={pinned_sha} effective_sha256={sha256})"
                ));
            }
        }
    }

    Ok(ResolvedCatalog {
        snapshot_path: dst_path,
        source,
        sha256,
        warning,
    })
}

async fn fetch_bytes(url: &str, timeout: Duration) -> Result<Vec<u8>, EngineError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let body: String = body.chars().take(2048).collect();
        return Err(EngineError::Config(format!(
            "status={} body={}",
            status.as_u16(),
            body.trim()
        )));
    }
    Ok(resp.bytes().await?.to_vec())
}
