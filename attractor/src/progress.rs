//! Best-effort progress mirroring to local files.
//!
//! Two artifacts under the logs root: `progress.ndjson`, an append-only
//! stream of one JSON object per line, and `live.json`, overwritten with
//! the latest event. Progress logging must never block or fail a run;
//! every I/O error here is swallowed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

pub const PROGRESS_FILE: &str = "progress.ndjson";
pub const LIVE_FILE: &str = "live.json";

#[derive(Clone)]
pub struct ProgressLog {
    inner: Arc<Inner>,
}

struct Inner {
    logs_root: Option<PathBuf>,
    run_id: String,
    mu: Mutex<ProgressState>,
    sink: Option<flume::Sender<Map<String, Value>>>,
}

#[derive(Default)]
struct ProgressState {
    last_progress_at: Option<Instant>,
}

impl ProgressLog {
    pub fn new(logs_root: Option<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                logs_root,
                run_id: run_id.into(),
                mu: Mutex::new(ProgressState::default()),
                sink: None,
            }),
        }
    }

    /// Variant that mirrors each event into a channel, for callers that
    /// watch progress live (tests, TUIs).
    pub fn with_sink(
        logs_root: Option<PathBuf>,
        run_id: impl Into<String>,
        sink: flume::Sender<Map<String, Value>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                logs_root,
                run_id: run_id.into(),
                mu: Mutex::new(ProgressState::default()),
                sink: Some(sink),
            }),
        }
    }

    /// Append one event. Injects `ts` (RFC3339, nanoseconds) and `run_id`
    /// when absent; the caller's map is cloned so the sink cannot observe
    /// later mutations.
    pub fn append(&self, event: &Map<String, Value>) {
        let mut ev = event.clone();
        if !ev.contains_key("ts") {
            ev.insert(
                "ts".to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)),
            );
        }
        if !ev.contains_key("run_id") && !self.inner.run_id.trim().is_empty() {
            ev.insert(
                "run_id".to_string(),
                Value::String(self.inner.run_id.clone()),
            );
        }

        let Some(logs_root) = &self.inner.logs_root else {
            self.mirror(ev);
            return;
        };
        let Ok(line) = serde_json::to_string(&ev) else {
            return;
        };

        {
            let mut state = self.inner.mu.lock();
            state.last_progress_at = Some(Instant::now());

            // Open/close per event so lines survive abrupt termination.
            let mut opts = OpenOptions::new();
            opts.create(true).append(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o644);
            }
            if let Ok(mut f) = opts.open(logs_root.join(PROGRESS_FILE)) {
                let _ = writeln!(f, "{line}");
            }
            let _ = std::fs::write(logs_root.join(LIVE_FILE), format!("{line}\n"));
        }
        self.mirror(ev);
    }

    /// Convenience: append an event built from key/value pairs.
    pub fn event<const N: usize>(&self, kind: &str, fields: [(&str, Value); N]) {
        let mut ev = Map::new();
        ev.insert("event".to_string(), Value::String(kind.to_string()));
        for (k, v) in fields {
            ev.insert(k.to_string(), v);
        }
        self.append(&ev);
    }

    pub fn last_progress_at(&self) -> Option<Instant> {
        self.inner.mu.lock().last_progress_at
    }

    fn mirror(&self, ev: Map<String, Value>) {
        if let Some(sink) = &self.inner.sink {
            let _ = sink.send(ev);
        }
    }
}
