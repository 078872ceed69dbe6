//! Stop-command behavior against a real child process.

use std::time::{Duration, Instant};

use attractor::runstate::{
    load_snapshot, pid_running, stop_run, StopError, Stopped, RUN_PID_FILE,
};

#[tokio::test]
async fn force_stop_kills_recorded_pid() {
    let logs = tempfile::tempdir().unwrap();

    let mut child = tokio::process::Command::new("sleep")
        .arg("60")
        .spawn()
        .expect("requires sleep binary");
    let pid = child.id().unwrap() as i32;
    std::fs::write(logs.path().join(RUN_PID_FILE), pid.to_string()).unwrap();

    // Reap concurrently: an unreaped child lingers as a zombie and still
    // answers the liveness probe.
    let reaper = tokio::spawn(async move { child.wait().await });

    let started = Instant::now();
    let report = stop_run(logs.path(), Duration::from_millis(500), true)
        .await
        .unwrap();
    assert_eq!(report.pid, pid);
    assert!(matches!(report.stopped, Stopped::Graceful | Stopped::Forced));
    assert!(started.elapsed() < Duration::from_millis(1500));

    let _ = reaper.await;
    assert!(!pid_running(pid));
}

#[tokio::test]
async fn graceful_stop_terminates_sigterm_friendly_process() {
    let logs = tempfile::tempdir().unwrap();

    let mut child = tokio::process::Command::new("sleep")
        .arg("60")
        .spawn()
        .unwrap();
    let pid = child.id().unwrap() as i32;
    std::fs::write(logs.path().join(RUN_PID_FILE), pid.to_string()).unwrap();

    // Reap concurrently so the pid leaves the process table on exit.
    let reaper = tokio::spawn(async move { child.wait().await });

    let report = stop_run(logs.path(), Duration::from_secs(2), false)
        .await
        .unwrap();
    assert_eq!(report.stopped, Stopped::Graceful);
    let _ = reaper.await;
}

#[tokio::test]
async fn snapshot_reflects_stopped_process() {
    let logs = tempfile::tempdir().unwrap();
    let mut child = tokio::process::Command::new("sleep")
        .arg("60")
        .spawn()
        .unwrap();
    let pid = child.id().unwrap() as i32;
    std::fs::write(logs.path().join(RUN_PID_FILE), pid.to_string()).unwrap();

    let before = load_snapshot(logs.path());
    assert!(before.pid_alive);

    let reaper = tokio::spawn(async move { child.wait().await });
    stop_run(logs.path(), Duration::from_secs(2), true)
        .await
        .unwrap();
    let _ = reaper.await;

    let after = load_snapshot(logs.path());
    assert_eq!(after.pid, pid);
    assert!(!after.pid_alive);
}

#[tokio::test]
async fn stop_without_force_reports_grace_elapsed() {
    let logs = tempfile::tempdir().unwrap();

    // A shell that ignores SIGTERM outlives the grace period.
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg("trap '' TERM; sleep 60")
        .spawn()
        .unwrap();
    let pid = child.id().unwrap() as i32;
    std::fs::write(logs.path().join(RUN_PID_FILE), pid.to_string()).unwrap();

    let err = stop_run(logs.path(), Duration::from_millis(200), false)
        .await
        .unwrap_err();
    assert!(matches!(err, StopError::GraceElapsed { .. }));

    let _ = child.kill().await;
    let _ = child.wait().await;
}
