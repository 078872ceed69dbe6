//! Shell executor (`parallelogram` nodes).
//!
//! Runs the node's `tool_command` through `sh -c` inside the worktree with
//! the base node environment. Exit 0 is success; anything else is a domain
//! failure whose reason carries the exit status and a stderr tail for the
//! classifier to inspect.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;

use super::{Execution, NodeHandler};
use crate::env::build_base_node_env;
use crate::error::EngineError;
use crate::outcome::Outcome;

pub struct ShellHandler;

const STDERR_TAIL_BYTES: usize = 512;

#[async_trait]
impl NodeHandler for ShellHandler {
    async fn execute(&self, exec: &Execution) -> Result<Outcome, EngineError> {
        let command = exec.node.attr("tool_command", "").trim().to_string();
        if command.is_empty() {
            return Ok(Outcome::fail("tool_command attribute is empty"));
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
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

        let mut child = cmd.spawn()?;
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = exec.cancel.cancelled() => {
                return Err(EngineError::Cancelled(format!(
                    "shell node {} cancelled", exec.node.id
                )));
            }
        };

        exec.progress.event(
            "tool_finished",
            [
                ("node_id", Value::String(exec.node.id.clone())),
                ("exit_code", Value::from(output.status.code().unwrap_or(-1))),
            ],
        );

        if output.status.success() {
            return Ok(Outcome::success());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail_str(stderr.trim(), STDERR_TAIL_BYTES);
        let reason = match (output.status.code(), tail.is_empty()) {
            (Some(code), true) => format!("tool_command exit status {code}"),
            (Some(code), false) => format!("tool_command exit status {code}: {tail}"),
            (None, _) => "tool_command terminated by signal".to_string(),
        };
        Ok(Outcome::fail(reason))
    }
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
