//! Run-state snapshot and the out-of-band stop operation.
//!
//! A running engine leaves `run.pid` under its logs root and mirrors its
//! latest progress event to `live.json`. The stop command reads both,
//! probes liveness with `kill(pid, 0)` semantics, and delivers a graceful
//! SIGTERM followed (optionally) by a forced SIGKILL.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::progress::LIVE_FILE;

pub const RUN_PID_FILE: &str = "run.pid";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Unknown,
    Running,
    Success,
    Fail,
}

/// Persisted run-state summary, assembled from `run.pid` and `live.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub logs_root: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_node_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,
    #[serde(default)]
    pub pid: i32,
    pub pid_alive: bool,
}

#[derive(Debug, Error, Diagnostic)]
pub enum StopError {
    #[error("run pid is not available (run.pid missing or invalid)")]
    #[diagnostic(code(attractor::stop::no_pid))]
    NoPid,

    #[error("pid {0} is not running")]
    #[diagnostic(code(attractor::stop::not_running))]
    NotRunning(i32),

    #[error("send {signal} to pid {pid}: {errno}")]
    #[diagnostic(code(attractor::stop::signal))]
    Signal {
        signal: &'static str,
        pid: i32,
        errno: Errno,
    },

    #[error("pid {pid} did not exit within {grace:?}")]
    #[diagnostic(
        code(attractor::stop::grace_elapsed),
        help("Pass --force to escalate to SIGKILL.")
    )]
    GraceElapsed { pid: i32, grace: Duration },

    #[error("pid {0} did not exit after SIGKILL")]
    #[diagnostic(code(attractor::stop::kill_failed))]
    KillFailed(i32),
}

/// How the process went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    Graceful,
    Forced,
}

impl Stopped {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stopped::Graceful => "graceful",
            Stopped::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopReport {
    pub pid: i32,
    pub stopped: Stopped,
}

/// Process liveness via signal 0. EPERM means the process exists but is
/// owned by someone else, which still counts as alive.
pub fn pid_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(errno) => errno == Errno::EPERM,
    }
}

/// Read `run.pid` and `live.json` into a [`Snapshot`].
///
/// A missing or corrupt `live.json` leaves the event fields at their
/// defaults; a missing `run.pid` leaves `pid` at 0 and `pid_alive` false.
pub fn load_snapshot(logs_root: &Path) -> Snapshot {
    let mut snap = Snapshot {
        logs_root: logs_root.to_string_lossy().into_owned(),
        ..Snapshot::default()
    };

    if let Ok(raw) = std::fs::read_to_string(logs_root.join(RUN_PID_FILE)) {
        if let Ok(pid) = raw.trim().parse::<i32>() {
            snap.pid = pid;
            snap.pid_alive = pid_running(pid);
        }
    }

    if let Ok(raw) = std::fs::read_to_string(logs_root.join(LIVE_FILE)) {
        if let Ok(live) = serde_json::from_str::<serde_json::Value>(&raw) {
            let field = |key: &str| -> String {
                live.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            snap.run_id = field("run_id");
            snap.last_event = field("event");
            snap.current_node_id = field("node_id");
            snap.failure_reason = field("failure_reason");
            snap.last_event_at = live
                .get("ts")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<DateTime<Utc>>().ok());
            snap.state = match field("state").as_str() {
                "running" => RunState::Running,
                "success" => RunState::Success,
                "fail" => RunState::Fail,
                _ => RunState::Unknown,
            };
        }
    }

    if snap.state == RunState::Unknown && snap.pid_alive {
        snap.state = RunState::Running;
    }
    snap
}

/// Terminate the run recorded under `logs_root`.
///
/// Sends SIGTERM and polls liveness at an adaptive interval until the
/// grace deadline. If the process is still alive and `force` is set,
/// escalates to SIGKILL and waits up to `max(grace, 1s)` for the exit.
pub async fn stop_run(
    logs_root: &Path,
    grace: Duration,
    force: bool,
) -> Result<StopReport, StopError> {
    let snapshot = load_snapshot(logs_root);
    if snapshot.pid <= 0 {
        return Err(StopError::NoPid);
    }
    if !snapshot.pid_alive {
        return Err(StopError::NotRunning(snapshot.pid));
    }
    let pid = snapshot.pid;

    send_signal(pid, Signal::SIGTERM, "SIGTERM")?;
    if wait_for_pid_exit(pid, grace).await {
        return Ok(StopReport {
            pid,
            stopped: Stopped::Graceful,
        });
    }

    if !force {
        return Err(StopError::GraceElapsed { pid, grace });
    }

    send_signal(pid, Signal::SIGKILL, "SIGKILL")?;
    let force_wait = grace.max(Duration::from_secs(1));
    if !wait_for_pid_exit(pid, force_wait).await {
        return Err(StopError::KillFailed(pid));
    }
    Ok(StopReport {
        pid,
        stopped: Stopped::Forced,
    })
}

fn send_signal(pid: i32, signal: Signal, name: &'static str) -> Result<(), StopError> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(()),
        // The process exited between the probe and the signal: a race, not
        // an error.
        Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(StopError::Signal {
            signal: name,
            pid,
            errno,
        }),
    }
}

async fn wait_for_pid_exit(pid: i32, grace: Duration) -> bool {
    if !pid_running(pid) {
        return true;
    }
    let poll = adaptive_grace_poll(grace);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(poll).await;
        if !pid_running(pid) {
            return true;
        }
    }
    !pid_running(pid)
}

/// `grace / 5`, clamped to [10ms, 100ms].
fn adaptive_grace_poll(grace: Duration) -> Duration {
    (grace / 5).clamp(Duration::from_millis(10), Duration::from_millis(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_poll_clamps() {
        assert_eq!(
            adaptive_grace_poll(Duration::from_millis(20)),
            Duration::from_millis(10)
        );
        assert_eq!(
            adaptive_grace_poll(Duration::from_millis(250)),
            Duration::from_millis(50)
        );
        assert_eq!(
            adaptive_grace_poll(Duration::from_secs(5)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn pid_running_rejects_nonpositive() {
        assert!(!pid_running(0));
        assert!(!pid_running(-4));
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_running(std::process::id() as i32));
    }

    #[test]
    fn snapshot_from_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let snap = load_snapshot(dir.path());
        assert_eq!(snap.pid, 0);
        assert!(!snap.pid_alive);
        assert_eq!(snap.state, RunState::Unknown);
    }

    #[test]
    fn snapshot_reads_pid_and_live() {
        let dir = tempfile::tempdir().unwrap();
        let pid = std::process::id();
        std::fs::write(dir.path().join(RUN_PID_FILE), pid.to_string()).unwrap();
        std::fs::write(
            dir.path().join(LIVE_FILE),
            serde_json::json!({
                "event": "node_finished",
                "node_id": "review",
                "run_id": "r1",
                "ts": "2026-01-05T10:00:00.000000000Z",
            })
            .to_string(),
        )
        .unwrap();

        let snap = load_snapshot(dir.path());
        assert_eq!(snap.pid, pid as i32);
        assert!(snap.pid_alive);
        assert_eq!(snap.last_event, "node_finished");
        assert_eq!(snap.current_node_id, "review");
        assert_eq!(snap.run_id, "r1");
        assert!(snap.last_event_at.is_some());
        // No explicit state in live.json, but the pid is alive.
        assert_eq!(snap.state, RunState::Running);
    }

    #[tokio::test]
    async fn stop_errors_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = stop_run(dir.path(), Duration::from_millis(100), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StopError::NoPid));
    }

    #[tokio::test]
    async fn stop_errors_when_pid_dead() {
        let dir = tempfile::tempdir().unwrap();
        // Spawn and reap a child so its pid is known-dead.
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        let _ = child.wait().await;
        std::fs::write(dir.path().join(RUN_PID_FILE), pid.to_string()).unwrap();
        let err = stop_run(dir.path(), Duration::from_millis(100), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StopError::NotRunning(_)));
    }
}
