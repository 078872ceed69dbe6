//! Node outcomes and run-level final status.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Status of a single node execution.
///
/// Domain failures are carried here, never as `Err`: a node handler that ran
/// its tool and watched it fail returns `Ok(Outcome { status: Fail, .. })`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    #[default]
    Success,
    Fail,
    Retry,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Fail => "fail",
            OutcomeStatus::Retry => "retry",
        }
    }

    /// Whether this status satisfies an `outcome=<value>` edge condition.
    ///
    /// Graph authors write `yes`/`fail` in the graph dialect; `yes` is an
    /// alias for success. Comparison is ASCII case-insensitive.
    pub fn matches_condition(&self, value: &str) -> bool {
        let value = value.trim();
        if value.eq_ignore_ascii_case(self.as_str()) {
            return true;
        }
        *self == OutcomeStatus::Success && value.eq_ignore_ascii_case("yes")
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of executing a node: status, an optional failure reason, and
/// adapter-provided annotations (`failure_class`, `failure_signature`, …).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub meta: FxHashMap<String, Value>,
}

impl Outcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Fail,
            failure_reason: reason.into(),
            meta: FxHashMap::default(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// A meta entry rendered as a trimmed string, when present and non-empty.
    pub fn meta_str(&self, key: &str) -> Option<String> {
        let v = self.meta.get(key)?;
        let s = match v {
            Value::String(s) => s.clone(),
            Value::Null => return None,
            other => other.to_string(),
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    Fail,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Success => "success",
            FinalStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
