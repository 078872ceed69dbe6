//! Run configuration.
//!
//! These structs are the target of the external config-file loader; the
//! engine only consumes the deserialized form. Defaults are chosen so a
//! minimal config (CXDB addresses + catalog path) is runnable.

use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::PathBuf;

/// Execution backend for an LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Cli,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub backend: Option<Backend>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: FxHashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UiAutostartConfig {
    #[serde(default)]
    pub enabled: bool,
    /// argv of the UI process; spawned detached with KILROY_LOGS_ROOT set.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutostartConfig {
    #[serde(default)]
    pub ui: UiAutostartConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CxdbConfig {
    pub binary_addr: String,
    pub http_base_url: String,
    #[serde(default)]
    pub autostart: AutostartConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDbConfig {
    /// Pinned catalog snapshot checked into the repo or ops tree.
    #[serde(default)]
    pub catalog_path: PathBuf,
    /// `pinned` or `on_run_start` (default).
    #[serde(default)]
    pub catalog_update_policy: String,
    #[serde(default)]
    pub catalog_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub cxdb: CxdbConfig,
    #[serde(default)]
    pub modeldb: ModelDbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Provider keys are matched case-insensitively and trimmed.
pub fn normalize_provider_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// The configured backend for a provider, if any.
pub fn backend_for(cfg: &RunConfig, provider: &str) -> Option<Backend> {
    cfg.llm
        .providers
        .get(&normalize_provider_key(provider))
        .and_then(|p| p.backend)
}
