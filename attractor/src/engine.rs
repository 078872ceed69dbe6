//! Run orchestrator.
//!
//! Composes the CXDB clients, preflight, catalog snapshot, progress log,
//! and scheduler into one outward entry point: [`Engine::run`]. The
//! engine's own PID lands in `<logs_root>/run.pid` so the out-of-band stop
//! command can find the run.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{backend_for, normalize_provider_key, RunConfig};
use crate::context::RunContext;
use crate::error::EngineError;
use crate::graph::{Graph, NodeShape};
use crate::modeldb::{self, CatalogPolicy};
use crate::outcome::FinalStatus;
use crate::preflight;
use crate::progress::ProgressLog;
use crate::runstate::RUN_PID_FILE;
use crate::scheduler::{RunInputs, Scheduler};
use crate::sink::{CxdbSink, RUN_FINISHED_TYPE_ID, RUN_STARTED_TYPE_ID};

pub const LOGS_ROOT_ENV: &str = "KILROY_LOGS_ROOT";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: String,
    pub logs_root: PathBuf,
    pub worktree: PathBuf,
    /// Run-wide cancellation signal; a default token is used when absent.
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug)]
pub struct RunResult {
    pub final_status: FinalStatus,
    pub cxdb_ui_url: String,
    pub bundle_id: String,
    pub context_id: String,
    pub completed_nodes: Vec<String>,
}

/// What CXDB bootstrap found and did.
#[derive(Debug, Clone, Default)]
pub struct CxdbStartupInfo {
    pub ui_url: String,
    pub ui_started: bool,
}

#[derive(Default)]
pub struct Engine {
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Execute `graph` under `config`. Returns the run result, or an error
    /// when the run could not be carried to terminal resolution (routing
    /// gap, unreachable CXDB, failed preflight, cancellation).
    #[instrument(skip(self, graph, config, options), fields(run_id = %options.run_id), err)]
    pub async fn run(
        &self,
        graph: Arc<Graph>,
        config: Arc<RunConfig>,
        options: RunOptions,
    ) -> Result<RunResult, EngineError> {
        validate_config(&graph, &config)?;

        std::fs::create_dir_all(&options.logs_root)?;
        std::fs::write(
            options.logs_root.join(RUN_PID_FILE),
            std::process::id().to_string(),
        )?;

        let progress = ProgressLog::new(Some(options.logs_root.clone()), options.run_id.clone());
        progress.event(
            "run_started",
            [("state", Value::String("running".into()))],
        );

        let (http, binary, startup) =
            ensure_cxdb_ready(&config, &options.logs_root, &options.run_id).await?;

        let ci = http.create_context("0").await?;
        let bundle_id = format!("kilroy-run-{}", options.run_id);
        let bundle = serde_json::json!({
            "run_id": options.run_id,
            "logs_root": options.logs_root.to_string_lossy(),
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = http.put_bundle(&bundle_id, &bundle).await {
            tracing::warn!(error = %e, "bundle registration failed");
        }
        let sink = Arc::new(CxdbSink::new(
            http.clone(),
            binary,
            options.run_id.clone(),
            ci.context_id.clone(),
            ci.head_turn_id.clone(),
            bundle_id.clone(),
        ));

        let mut started = Map::new();
        started.insert("run_id".into(), Value::String(options.run_id.clone()));
        started.insert("goal".into(), Value::String(graph.goal().to_string()));
        sink.append(RUN_STARTED_TYPE_ID, 1, started).await?;

        preflight::run_provider_preflight(&graph, &config, &options.logs_root).await?;

        let policy = CatalogPolicy::parse(&config.modeldb.catalog_update_policy)?;
        let catalog = modeldb::resolve_model_catalog(
            &config.modeldb.catalog_path,
            &options.logs_root,
            policy,
            Some(config.modeldb.catalog_url.as_str()).filter(|s| !s.trim().is_empty()),
            None,
        )
        .await?;
        if let Some(warning) = &catalog.warning {
            tracing::warn!("{warning}");
        }

        let inputs = RunInputs {
            graph,
            config,
            run_id: options.run_id.clone(),
            worktree: options.worktree.clone(),
            logs_root: Some(options.logs_root.clone()),
            progress: progress.clone(),
            cancel: options.cancel.clone().unwrap_or_default(),
        };

        let schedule = self
            .scheduler
            .run(&inputs, RunContext::new(), Some(sink.clone()))
            .await;

        let (final_status, failure_reason, schedule_err) = match schedule {
            Ok(res) => (
                res.final_status,
                res.last_outcome.failure_reason.clone(),
                Ok(res),
            ),
            Err(e) => (FinalStatus::Fail, e.to_string(), Err(e)),
        };

        let mut finished = Map::new();
        finished.insert("run_id".into(), Value::String(options.run_id.clone()));
        finished.insert(
            "final_status".into(),
            Value::String(final_status.as_str().into()),
        );
        if !failure_reason.is_empty() {
            finished.insert(
                "failure_reason".into(),
                Value::String(failure_reason.clone()),
            );
        }
        if let Err(e) = sink.append(RUN_FINISHED_TYPE_ID, 1, finished).await {
            tracing::warn!(error = %e, "run_finished turn append failed");
        }

        let mut ev = Map::new();
        ev.insert("event".into(), Value::String("run_finished".into()));
        ev.insert(
            "state".into(),
            Value::String(final_status.as_str().into()),
        );
        if !failure_reason.is_empty() {
            ev.insert("failure_reason".into(), Value::String(failure_reason));
        }
        progress.append(&ev);

        let res = schedule_err?;
        Ok(RunResult {
            final_status: res.final_status,
            cxdb_ui_url: startup.ui_url,
            bundle_id,
            context_id: ci.context_id,
            completed_nodes: res.completed_nodes,
        })
    }
}

/// Fail fast on configuration the run cannot proceed without: CXDB
/// addresses, a pinned catalog path, and a backend for every provider the
/// graph references.
fn validate_config(graph: &Graph, config: &RunConfig) -> Result<(), EngineError> {
    if config.cxdb.binary_addr.trim().is_empty() {
        return Err(EngineError::Config("cxdb.binary_addr is required".into()));
    }
    if config.cxdb.http_base_url.trim().is_empty() {
        return Err(EngineError::Config("cxdb.http_base_url is required".into()));
    }
    if config.modeldb.catalog_path.as_os_str().is_empty() {
        return Err(EngineError::Config(
            "modeldb.catalog_path is required".into(),
        ));
    }
    for node in graph.nodes() {
        if node.shape != NodeShape::LlmCli {
            continue;
        }
        let provider = normalize_provider_key(node.attr("llm_provider", ""));
        if provider.is_empty() {
            continue;
        }
        if backend_for(config, &provider).is_none() {
            return Err(EngineError::Config(format!(
                "no backend configured for provider {provider} (node {})",
                node.id
            )));
        }
    }
    Ok(())
}

/// Probe the CXDB HTTP and binary endpoints and resolve the UI URL.
///
/// When the service is unreachable the error carries remediation guidance;
/// when UI autostart is configured its command is spawned detached with
/// the logs root exported.
pub async fn ensure_cxdb_ready(
    config: &RunConfig,
    logs_root: &std::path::Path,
    run_id: &str,
) -> Result<(cxdb::Client, Arc<cxdb::BinaryClient>, CxdbStartupInfo), EngineError> {
    let http = cxdb::Client::new(&config.cxdb.http_base_url);
    if let Err(e) = http.health().await {
        return Err(EngineError::Config(format!(
            "cxdb is not reachable at {} ({e}); start the service or set \
             cxdb.autostart.enabled=true in the run config",
            config.cxdb.http_base_url
        )));
    }
    let client_tag = format!("kilroy-attractor/{run_id}");
    let binary = match cxdb::BinaryClient::dial(&config.cxdb.binary_addr, &client_tag).await {
        Ok(b) => Arc::new(b),
        Err(e) => {
            return Err(EngineError::Config(format!(
                "cxdb binary listener is not reachable at {} ({e}); start the \
                 service or set cxdb.autostart.enabled=true in the run config",
                config.cxdb.binary_addr
            )));
        }
    };

    let mut info = CxdbStartupInfo {
        ui_url: resolve_ui_url(&config.cxdb.autostart.ui.url, &config.cxdb.http_base_url).await,
        ui_started: false,
    };

    let ui = &config.cxdb.autostart.ui;
    if ui.enabled && !ui.command.is_empty() {
        let mut cmd = tokio::process::Command::new(&ui.command[0]);
        cmd.args(&ui.command[1..])
            .env(LOGS_ROOT_ENV, logs_root)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        match cmd.spawn() {
            Ok(_child) => {
                info.ui_started = true;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cxdb ui autostart failed");
            }
        }
    }

    Ok((http, binary, info))
}

/// The configured UI URL wins; otherwise probe the HTTP base for an HTML
/// document and use the base itself. Best-effort: an empty string means no
/// UI was found.
pub async fn resolve_ui_url(configured: &str, base_url: &str) -> String {
    let configured = configured.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if base.is_empty() {
        return String::new();
    }
    let Ok(client) = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()
    else {
        return String::new();
    };
    match client.get(base).send().await {
        Ok(resp) if resp.status().is_success() => {
            let is_html = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.contains("text/html"));
            if is_html {
                return base.to_string();
            }
            let body = resp.text().await.unwrap_or_default();
            if body.to_ascii_lowercase().contains("<html") {
                base.to_string()
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}
