//! Shared run context: a concurrent key→value store visible to executors.
//!
//! Fan-out workers write their branch results here (`parallel.results`);
//! the fan-in handler reads them back. Values use the same dynamic model
//! as turn payloads.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;

/// Key under which fan-out branch results are aggregated for fan-in.
pub const PARALLEL_RESULTS_KEY: &str = "parallel.results";

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    inner: Arc<RwLock<FxHashMap<String, Value>>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    /// Snapshot of the whole map, decoupled from subsequent writes.
    pub fn snapshot(&self) -> FxHashMap<String, Value> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let ctx = RunContext::new();
        let other = ctx.clone();
        other.set("k", Value::from(1));
        assert_eq!(ctx.get("k"), Some(Value::from(1)));
    }

    #[test]
    fn snapshot_is_decoupled() {
        let ctx = RunContext::new();
        ctx.set("k", Value::from("v"));
        let snap = ctx.snapshot();
        ctx.set("k", Value::from("changed"));
        assert_eq!(snap.get("k"), Some(&Value::from("v")));
    }
}
