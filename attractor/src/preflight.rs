//! Provider CLI preflight.
//!
//! Before a run starts, every CLI provider referenced by a `box` node must
//! resolve on PATH and advertise the capabilities the adapters rely on.
//! Missing binaries and missing capability tokens fail the run up front;
//! probe *invocation* failures only warn unless
//! `KILROY_PREFLIGHT_STRICT_CAPABILITIES=true`. A JSON report is written to
//! `<logs_root>/preflight_report.json` whatever the outcome.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::{backend_for, normalize_provider_key, Backend, RunConfig};
use crate::error::EngineError;
use crate::graph::{Graph, NodeShape};

pub const PREFLIGHT_REPORT_FILE: &str = "preflight_report.json";
pub const STRICT_CAPABILITIES_ENV: &str = "KILROY_PREFLIGHT_STRICT_CAPABILITIES";
pub const CAPABILITY_PROBES_ENV: &str = "KILROY_PREFLIGHT_CAPABILITY_PROBES";

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const STATUS_PASS: &str = "pass";
const STATUS_WARN: &str = "warn";
const STATUS_FAIL: &str = "fail";

#[derive(Debug, Default, Serialize)]
pub struct PreflightReport {
    pub generated_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub completed_at: String,
    pub strict_capabilities: bool,
    pub capability_probe_mode: String,
    pub checks: Vec<PreflightCheck>,
    pub summary: PreflightSummary,
}

#[derive(Debug, Serialize)]
pub struct PreflightCheck {
    pub name: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider: String,
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Default, Serialize)]
pub struct PreflightSummary {
    pub pass: u32,
    pub warn: u32,
    pub fail: u32,
}

/// The CLI invocation for a provider: executable plus the argument prefix
/// shared by every call. The per-call argument shaping lives in the
/// provider adapters.
pub fn default_cli_invocation(provider: &str) -> Option<&'static str> {
    match normalize_provider_key(provider).as_str() {
        "openai" => Some("openai"),
        "anthropic" => Some("anthropic"),
        "google" => Some("google"),
        _ => None,
    }
}

/// CLI providers actually referenced by `box` nodes, deduped and sorted.
pub fn used_cli_providers(graph: &Graph, cfg: &RunConfig) -> Vec<String> {
    let mut used: Vec<String> = graph
        .nodes()
        .filter(|n| n.shape == NodeShape::LlmCli)
        .filter_map(|n| {
            let provider = normalize_provider_key(n.attr("llm_provider", ""));
            if provider.is_empty() {
                return None;
            }
            (backend_for(cfg, &provider) == Some(Backend::Cli)).then_some(provider)
        })
        .collect();
    used.sort();
    used.dedup();
    used
}

fn capability_probe_mode() -> &'static str {
    let raw = std::env::var(CAPABILITY_PROBES_ENV).unwrap_or_default();
    if raw.trim().eq_ignore_ascii_case("off") {
        "off"
    } else {
        "on"
    }
}

fn strict_capabilities() -> bool {
    let raw = std::env::var(STRICT_CAPABILITIES_ENV).unwrap_or_default();
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Tokens a provider's help output must contain. `all` tokens are each
/// required; each `any_of` group requires at least one member.
fn missing_capability_tokens(provider: &str, help_output: &str) -> Vec<String> {
    let text = help_output.to_ascii_lowercase();
    let (all, any_of): (&[&str], &[&[&str]]) = match normalize_provider_key(provider).as_str() {
        "anthropic" => (&["--output-format", "stream-json", "--verbose"], &[]),
        "google" => (&["--output-format"], &[&["--yolo", "--approval-mode"]]),
        "openai" => (&["--json", "--sandbox"], &[]),
        _ => return Vec::new(),
    };

    let mut missing = Vec::new();
    for token in all {
        if !text.contains(token) {
            missing.push((*token).to_string());
        }
    }
    for set in any_of {
        if !set.iter().any(|t| text.contains(t)) {
            missing.push(set.join("|"));
        }
    }
    missing
}

fn resolve_in_path(exe: &str) -> Option<PathBuf> {
    if exe.contains('/') {
        let p = PathBuf::from(exe);
        return p.is_file().then_some(p);
    }
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(exe);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

async fn run_capability_probe(provider: &str, exe_path: &Path) -> Result<String, String> {
    let argv: &[&str] = if normalize_provider_key(provider) == "openai" {
        &["exec", "--help"]
    } else {
        &["--help"]
    };

    let child = tokio::process::Command::new(exe_path)
        .args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();
    let output = match tokio::time::timeout(PROBE_TIMEOUT, child).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => return Err(format!("probe command failed: {e}")),
        Err(_) => return Err(format!("probe timed out after {}s", PROBE_TIMEOUT.as_secs())),
    };
    if !output.status.success() {
        return Err(format!("probe command failed: exit {}", output.status));
    }
    let mut help = String::from_utf8_lossy(&output.stdout).into_owned();
    help.push_str(&String::from_utf8_lossy(&output.stderr));
    let help = help.trim().to_string();
    if help.is_empty() {
        return Err("probe output empty".to_string());
    }
    Ok(help)
}

/// Run the preflight checks for every CLI provider the graph uses.
///
/// Returns the report on success; the report is also written to the logs
/// root on both success and failure.
pub async fn run_provider_preflight(
    graph: &Graph,
    cfg: &RunConfig,
    logs_root: &Path,
) -> Result<PreflightReport, EngineError> {
    let mut report = PreflightReport {
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        strict_capabilities: strict_capabilities(),
        capability_probe_mode: capability_probe_mode().to_string(),
        ..PreflightReport::default()
    };

    let result = run_checks(graph, cfg, &mut report).await;
    if let Err(e) = write_report(logs_root, &mut report) {
        tracing::warn!(error = %e, "failed to write preflight report");
    }
    result.map(|()| report)
}

async fn run_checks(
    graph: &Graph,
    cfg: &RunConfig,
    report: &mut PreflightReport,
) -> Result<(), EngineError> {
    let providers = used_cli_providers(graph, cfg);
    if providers.is_empty() {
        report.checks.push(PreflightCheck {
            name: "provider_cli_presence",
            provider: String::new(),
            status: STATUS_PASS,
            message: "no cli providers used by graph".into(),
            details: None,
        });
        return Ok(());
    }

    for provider in providers {
        let Some(exe) = default_cli_invocation(&provider) else {
            report.checks.push(PreflightCheck {
                name: "provider_cli_presence",
                provider: provider.clone(),
                status: STATUS_FAIL,
                message: "no cli invocation mapping for provider".into(),
                details: None,
            });
            return Err(EngineError::Preflight(format!(
                "no cli invocation mapping for provider {provider}"
            )));
        };
        let Some(resolved) = resolve_in_path(exe) else {
            report.checks.push(PreflightCheck {
                name: "provider_cli_presence",
                provider: provider.clone(),
                status: STATUS_FAIL,
                message: format!("cli binary not found: {exe}"),
                details: None,
            });
            return Err(EngineError::Preflight(format!(
                "provider {provider} cli binary not found: {exe}"
            )));
        };
        report.checks.push(PreflightCheck {
            name: "provider_cli_presence",
            provider: provider.clone(),
            status: STATUS_PASS,
            message: "cli binary resolved".into(),
            details: Some(serde_json::json!({
                "executable": exe,
                "path": resolved.to_string_lossy(),
            })),
        });

        if report.capability_probe_mode == "off" {
            report.checks.push(PreflightCheck {
                name: "provider_cli_capabilities",
                provider: provider.clone(),
                status: STATUS_PASS,
                message: format!(
                    "capability probe disabled by {CAPABILITY_PROBES_ENV}=off"
                ),
                details: None,
            });
            continue;
        }

        let help = match run_capability_probe(&provider, &resolved).await {
            Ok(help) => help,
            Err(probe_err) => {
                let strict = report.strict_capabilities;
                report.checks.push(PreflightCheck {
                    name: "provider_cli_capabilities",
                    provider: provider.clone(),
                    status: if strict { STATUS_FAIL } else { STATUS_WARN },
                    message: format!("capability probe failed: {probe_err}"),
                    details: None,
                });
                if strict {
                    return Err(EngineError::Preflight(format!(
                        "provider {provider} capability probe failed: {probe_err}"
                    )));
                }
                tracing::warn!(provider = %provider, error = %probe_err, "capability probe failed");
                continue;
            }
        };

        let missing = missing_capability_tokens(&provider, &help);
        if !missing.is_empty() {
            report.checks.push(PreflightCheck {
                name: "provider_cli_capabilities",
                provider: provider.clone(),
                status: STATUS_FAIL,
                message: format!("required capabilities missing: {}", missing.join(", ")),
                details: None,
            });
            return Err(EngineError::Preflight(format!(
                "provider {provider} capability probe missing required tokens: {}",
                missing.join(", ")
            )));
        }
        report.checks.push(PreflightCheck {
            name: "provider_cli_capabilities",
            provider,
            status: STATUS_PASS,
            message: "required capabilities detected".into(),
            details: None,
        });
    }
    Ok(())
}

fn write_report(logs_root: &Path, report: &mut PreflightReport) -> Result<(), EngineError> {
    report.completed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    report.summary = PreflightSummary::default();
    for check in &report.checks {
        match check.status {
            STATUS_PASS => report.summary.pass += 1,
            STATUS_WARN => report.summary.warn += 1,
            _ => report.summary.fail += 1,
        }
    }
    if logs_root.as_os_str().is_empty() {
        return Err(EngineError::Config("logs root is empty".into()));
    }
    std::fs::create_dir_all(logs_root)?;
    let path = logs_root.join(PREFLIGHT_REPORT_FILE);
    std::fs::write(path, serde_json::to_vec_pretty(report)?)?;
    Ok(())
}
