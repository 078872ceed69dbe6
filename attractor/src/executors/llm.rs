//! LLM CLI executor (`box` nodes).
//!
//! Selects the configured backend for the node's provider (currently CLI
//! only), invokes the provider binary with arguments derived from node
//! attributes, and pumps the CLI's stream-json stdout through a
//! [`ChanStream`] into the progress log. Exit 0 with no adapter-set
//! failure reason is success; everything else is a domain failure.
//!
//! The openai CLI keeps a local state database that occasionally loses the
//! rollout path for a session; those invocations are retried.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{Execution, NodeHandler};
use crate::config::{backend_for, normalize_provider_key, Backend};
use crate::env::build_base_node_env;
use crate::error::EngineError;
use crate::outcome::Outcome;
use crate::preflight::default_cli_invocation;
use crate::stream::{ChanStream, StreamEvent, StreamEventKind};

pub const STATE_DB_MAX_RETRIES_ENV: &str = "KILROY_CODEX_STATE_DB_MAX_RETRIES";
const DEFAULT_STATE_DB_MAX_RETRIES: u32 = 2;

const STDERR_TAIL_BYTES: usize = 1024;

#[derive(Default)]
pub struct LlmCliHandler;

#[async_trait]
impl NodeHandler for LlmCliHandler {
    async fn execute(&self, exec: &Execution) -> Result<Outcome, EngineError> {
        let provider = normalize_provider_key(exec.node.attr("llm_provider", ""));
        if provider.is_empty() {
            return Ok(Outcome::fail("llm_provider attribute is empty"));
        }
        match backend_for(&exec.config, &provider) {
            Some(Backend::Cli) => {}
            None => {
                return Err(EngineError::Config(format!(
                    "no backend configured for provider {provider}"
                )));
            }
        }
        let Some(exe) = default_cli_invocation(&provider) else {
            return Err(EngineError::Config(format!(
                "no cli invocation mapping for provider {provider}"
            )));
        };

        let model = exec.node.attr("llm_model", "").trim().to_string();
        let prompt = exec.node.attr("prompt", "").trim().to_string();
        let argv = provider_argv(&provider, &model, &prompt);

        let max_retries = if provider == "openai" {
            state_db_max_retries()
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            let invocation = self.invoke_once(exec, &provider, exe, &argv).await?;
            if invocation.exit_ok && invocation.failure_reason.is_none() {
                return Ok(Outcome::success());
            }
            if !invocation.exit_ok
                && attempt < max_retries
                && is_state_db_discrepancy(&invocation.stderr)
            {
                attempt += 1;
                tracing::warn!(
                    node_id = %exec.node.id,
                    attempt,
                    "state db discrepancy; retrying cli invocation"
                );
                continue;
            }
            let reason = invocation.failure_reason.unwrap_or_else(|| {
                let tail = tail_str(invocation.stderr.trim(), STDERR_TAIL_BYTES);
                match (invocation.exit_code, tail.is_empty()) {
                    (Some(code), true) => format!("{provider} cli exit status {code}"),
                    (Some(code), false) => format!("{provider} cli exit status {code}: {tail}"),
                    (None, _) => format!("{provider} cli terminated by signal"),
                }
            });
            return Ok(Outcome::fail(reason));
        }
    }
}

struct Invocation {
    exit_ok: bool,
    exit_code: Option<i32>,
    stderr: String,
    /// Set when the adapter saw a terminal error event in the stream.
    failure_reason: Option<String>,
}

impl LlmCliHandler {
    async fn invoke_once(
        &self,
        exec: &Execution,
        provider: &str,
        exe: &str,
        argv: &[String],
    ) -> Result<Invocation, EngineError> {
        let child_cancel = exec.cancel.child_token();
        let stream = Arc::new(ChanStream::new(child_cancel.clone()));
        let mut events = stream.events();

        // Consumer: forward provider events into the progress log and watch
        // for terminal error events.
        let progress = exec.progress.clone();
        let node_id = exec.node.id.clone();
        let consumer = tokio::spawn(async move {
            let mut failure: Option<String> = None;
            while let Some(ev) = events.recv().await {
                match ev.kind {
                    StreamEventKind::ProviderEvent => {
                        if failure.is_none() {
                            failure = terminal_error_reason(&ev.raw);
                        }
                        let mut fields = serde_json::Map::new();
                        fields.insert("node_id".to_string(), Value::String(node_id.clone()));
                        fields.insert(
                            "provider_event".to_string(),
                            Value::Object(
                                ev.raw.into_iter().collect::<serde_json::Map<_, _>>(),
                            ),
                        );
                        fields.insert("event".to_string(), Value::String("llm_event".into()));
                        progress.append(&fields);
                    }
                    StreamEventKind::Stderr | StreamEventKind::Completed => {}
                }
            }
            failure
        });

        let mut cmd = tokio::process::Command::new(exe);
        cmd.args(argv)
            .current_dir(&exec.worktree)
            .env_clear()
            .envs(build_base_node_env(&exec.worktree))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(logs_root) = &exec.logs_root {
            cmd.env("KILROY_LOGS_ROOT", logs_root);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::wrap_adapter(provider, e.into()))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Producer: one stream-json line per provider event.
        let producer = {
            let stream = stream.clone();
            tokio::spawn(async move {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<FxHashMap<String, Value>>(&line) {
                            Ok(raw) => stream.send(StreamEvent::provider(raw)).await,
                            Err(_) => {
                                let mut raw = FxHashMap::default();
                                raw.insert("text".to_string(), Value::String(line));
                                stream.send(StreamEvent::provider(raw)).await;
                            }
                        }
                    }
                }
                stream.send(StreamEvent::completed()).await;
                stream.close_send();
            })
        };

        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = exec.cancel.cancelled() => {
                // Kill first: close() waits for the producer to exhaust the
                // child's stdout, which only happens once the child dies.
                let _ = child.kill().await;
                stream.close().await;
                consumer.abort();
                return Err(EngineError::Cancelled(format!(
                    "llm node {} cancelled", exec.node.id
                )));
            }
        };

        producer.await?;
        let failure_reason = consumer.await?;
        let stderr = stderr_reader.await?;

        Ok(Invocation {
            exit_ok: status.success(),
            exit_code: status.code(),
            stderr,
            failure_reason,
        })
    }
}

/// Argument shaping per provider. The full adapter surface (session
/// resumption, tool permissions, schema enforcement) lives with the
/// provider adapters; this is the invocation the engine owns.
fn provider_argv(provider: &str, model: &str, prompt: &str) -> Vec<String> {
    let mut argv: Vec<String> = match provider {
        "anthropic" => vec![
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "-p".into(),
            prompt.to_string(),
        ],
        "google" => vec![
            "--output-format".into(),
            "json".into(),
            "--yolo".into(),
            "--prompt".into(),
            prompt.to_string(),
        ],
        "openai" => vec![
            "exec".into(),
            "--json".into(),
            "--sandbox".into(),
            "workspace-write".into(),
            prompt.to_string(),
        ],
        other => vec!["--prompt".into(), prompt.to_string(), format!("--provider={other}")],
    };
    if !model.is_empty() {
        argv.push("--model".into());
        argv.push(model.to_string());
    }
    argv
}

/// A terminal error event in the provider stream sets the failure reason
/// even when the CLI exits 0.
fn terminal_error_reason(raw: &FxHashMap<String, Value>) -> Option<String> {
    let ty = raw.get("type").and_then(Value::as_str)?;
    if ty != "error" {
        return None;
    }
    let msg = raw
        .get("message")
        .or_else(|| raw.get("error"))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "provider reported an error event".to_string());
    Some(msg)
}

/// `KILROY_CODEX_STATE_DB_MAX_RETRIES`: default 2, `0` disables retries,
/// anything unparsable falls back to the default with a warning.
pub fn state_db_max_retries() -> u32 {
    let raw = std::env::var(STATE_DB_MAX_RETRIES_ENV).unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return DEFAULT_STATE_DB_MAX_RETRIES;
    }
    match raw.parse::<u32>() {
        Ok(n) => n,
        Err(_) => {
            tracing::warn!(
                value = raw,
                "invalid {STATE_DB_MAX_RETRIES_ENV}; using default"
            );
            DEFAULT_STATE_DB_MAX_RETRIES
        }
    }
}

/// Stderr markers of a codex state-db discrepancy.
pub fn is_state_db_discrepancy(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("state db missing rollout") || s.contains("record_discrepancy")
}

fn tail_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
