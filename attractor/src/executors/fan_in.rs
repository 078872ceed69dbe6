//! Fan-in reduction over parallel branch outcomes.
//!
//! Branch workers leave their results in the run context under
//! `parallel.results`; the fan-in handler reduces them to one outcome.
//! Aggregation is pessimistic about retries: the combined failure class is
//! deterministic when *any* branch failed deterministically, because
//! restarting the fan-out cannot fix that branch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Execution, NodeHandler};
use crate::classify::{
    classify_failure, failure_signature, FailureClass, FAILURE_META_CLASS, FAILURE_META_SIGNATURE,
};
use crate::context::{RunContext, PARALLEL_RESULTS_KEY};
use crate::error::EngineError;
use crate::outcome::{Outcome, OutcomeStatus};

/// One branch's contribution to a fan-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchResult {
    pub branch_key: String,
    pub outcome: Outcome,
}

pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    async fn execute(&self, exec: &Execution) -> Result<Outcome, EngineError> {
        let results = load_branch_results(&exec.context)?;
        Ok(aggregate_branches(&results))
    }
}

pub(crate) fn load_branch_results(ctx: &RunContext) -> Result<Vec<BranchResult>, EngineError> {
    match ctx.get(PARALLEL_RESULTS_KEY) {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(Vec::new()),
    }
}

/// Reduce branch outcomes: success iff every branch succeeded. On failure
/// the outcome carries the aggregated `failure_class` and a non-empty
/// `failure_signature`.
pub fn aggregate_branches(results: &[BranchResult]) -> Outcome {
    let failed: Vec<&BranchResult> = results
        .iter()
        .filter(|r| r.outcome.status != OutcomeStatus::Success)
        .collect();
    if failed.is_empty() {
        return Outcome::success();
    }

    let class = failed
        .iter()
        .map(|r| classify_failure(&r.outcome))
        .fold(FailureClass::TransientInfra, |acc, c| {
            if acc == FailureClass::Deterministic || c == FailureClass::Deterministic {
                FailureClass::Deterministic
            } else {
                FailureClass::TransientInfra
            }
        });

    let mut parts: Vec<String> = Vec::with_capacity(failed.len());
    for r in &failed {
        let reason = if r.outcome.failure_reason.is_empty() {
            r.outcome.status.as_str().to_string()
        } else {
            r.outcome.failure_reason.clone()
        };
        parts.push(format!("{}: {reason}", r.branch_key));
    }
    let reason = format!("{} branch(es) failed: {}", failed.len(), parts.join("; "));

    let mut out = Outcome::fail(reason)
        .with_meta(FAILURE_META_CLASS, Value::String(class.as_str().to_string()));
    let signature = failure_signature(&out);
    out = out.with_meta(FAILURE_META_SIGNATURE, Value::String(signature));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(key: &str, reason: &str) -> BranchResult {
        BranchResult {
            branch_key: key.to_string(),
            outcome: Outcome::fail(reason),
        }
    }

    fn ok(key: &str) -> BranchResult {
        BranchResult {
            branch_key: key.to_string(),
            outcome: Outcome::success(),
        }
    }

    #[test]
    fn all_success_aggregates_to_success() {
        let out = aggregate_branches(&[ok("a"), ok("b")]);
        assert_eq!(out.status, OutcomeStatus::Success);
    }

    #[test]
    fn deterministic_if_any_branch_deterministic() {
        let out = aggregate_branches(&[
            branch("a", "request timeout after 10s"),
            branch("b", "unknown flag: --verbose"),
        ]);
        assert_eq!(out.status, OutcomeStatus::Fail);
        assert_eq!(
            out.meta_str(FAILURE_META_CLASS).as_deref(),
            Some("deterministic")
        );
        assert!(!out.meta_str(FAILURE_META_SIGNATURE).unwrap().is_empty());
    }

    #[test]
    fn transient_only_when_all_branches_transient() {
        let out = aggregate_branches(&[
            branch("a", "request timeout after 10s"),
            branch("b", "connection reset by peer"),
        ]);
        assert_eq!(
            out.meta_str(FAILURE_META_CLASS).as_deref(),
            Some("transient_infra")
        );
        assert_eq!(out.meta_str(FAILURE_META_SIGNATURE).unwrap().len(), 24);
    }

    #[test]
    fn partial_failure_names_only_failed_branches() {
        let out = aggregate_branches(&[ok("a"), branch("b", "timed out")]);
        assert_eq!(out.status, OutcomeStatus::Fail);
        assert!(out.failure_reason.contains("b: timed out"));
        assert!(!out.failure_reason.contains("a:"));
    }

    #[test]
    fn empty_results_succeed() {
        assert_eq!(aggregate_branches(&[]).status, OutcomeStatus::Success);
    }
}
