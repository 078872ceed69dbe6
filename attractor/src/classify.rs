//! Failure classification and restart eligibility.
//!
//! Classification is fail-closed: anything not positively identified as
//! transient infrastructure is deterministic, so retries stay the
//! exception. The signature digests class + normalised reason so that
//! equivalent failures (case / whitespace variants) collapse to one
//! identity.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::outcome::{Outcome, OutcomeStatus};

pub const FAILURE_META_CLASS: &str = "failure_class";
pub const FAILURE_META_SIGNATURE: &str = "failure_signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    TransientInfra,
    Deterministic,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TransientInfra => "transient_infra",
            FailureClass::Deterministic => "deterministic",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognised spellings of the explicit class annotation. Unrecognised
/// tokens are rejected so that a typo falls through to reason matching.
fn parse_failure_class(raw: &str) -> Option<FailureClass> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "transient" | "transient_infra" | "transientinfra" => Some(FailureClass::TransientInfra),
        "deterministic" => Some(FailureClass::Deterministic),
        _ => None,
    }
}

const DETERMINISTIC_MARKERS: &[&str] = &[
    "unknown flag",
    "unsupported flag",
    "unsupported argument",
    "invalid argument",
    "invalid option",
    "unrecognized option",
    "requires an argument",
    "missing required",
    "not a valid branch name",
    "path does not exist",
    "invalid schema",
    "invalid_json_schema",
    "contract mismatch",
    "unsupported capability",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "temporary",
    "connection reset",
    "connection refused",
    "connection aborted",
    "connection closed",
    "too many requests",
    "rate limit",
    " 429 ",
    " 502 ",
    " 503 ",
    " 504 ",
    "econnreset",
    "econnrefused",
    "service unavailable",
    "try again",
];

fn has_any(s: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| s.contains(m))
}

/// Map an outcome to its failure class.
///
/// Precedence: an explicit recognised `meta.failure_class` wins; an empty
/// reason is deterministic; deterministic markers beat transient markers;
/// the default is deterministic.
pub fn classify_failure(out: &Outcome) -> FailureClass {
    if let Some(raw) = out.meta_str(FAILURE_META_CLASS) {
        if let Some(class) = parse_failure_class(&raw) {
            return class;
        }
    }

    let reason = out.failure_reason.trim().to_ascii_lowercase();
    if reason.is_empty() {
        return FailureClass::Deterministic;
    }
    if has_any(&reason, DETERMINISTIC_MARKERS) {
        return FailureClass::Deterministic;
    }
    if has_any(&reason, TRANSIENT_MARKERS) {
        return FailureClass::TransientInfra;
    }
    FailureClass::Deterministic
}

/// Stable 24-hex-char identity for equivalent failures.
pub fn failure_signature(out: &Outcome) -> String {
    let class = classify_failure(out);
    let mut reason = normalize_failure_reason(&out.failure_reason);
    if reason.is_empty() {
        reason = "unknown".to_string();
    }
    let digest = Sha256::digest(format!("{class}|{reason}").as_bytes());
    hex::encode(digest)[..24].to_string()
}

/// A retry is eligible iff the node failed (or asked to retry) for
/// transient-infrastructure reasons.
pub fn should_retry(out: &Outcome) -> bool {
    if out.status != OutcomeStatus::Fail && out.status != OutcomeStatus::Retry {
        return false;
    }
    classify_failure(out) == FailureClass::TransientInfra
}

/// Lowercase, trim, collapse whitespace runs.
fn normalize_failure_reason(reason: &str) -> String {
    reason
        .trim()
        .to_ascii_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn fail(reason: &str) -> Outcome {
        Outcome::fail(reason)
    }

    #[test]
    fn explicit_transient_meta_wins() {
        let out = fail("some failure").with_meta(
            FAILURE_META_CLASS,
            Value::String("transient_infra".into()),
        );
        assert_eq!(classify_failure(&out), FailureClass::TransientInfra);
    }

    #[test]
    fn fail_closed_to_deterministic() {
        let cases = [
            fail("some unknown error"),
            fail("some unknown error")
                .with_meta(FAILURE_META_CLASS, Value::String("not-a-real-class".into())),
            fail("some unknown error").with_meta(FAILURE_META_CLASS, Value::String("".into())),
        ];
        for (i, out) in cases.iter().enumerate() {
            assert_eq!(
                classify_failure(out),
                FailureClass::Deterministic,
                "case {i}"
            );
        }
    }

    #[test]
    fn empty_reason_is_deterministic() {
        assert_eq!(classify_failure(&fail("")), FailureClass::Deterministic);
        assert_eq!(classify_failure(&fail("   ")), FailureClass::Deterministic);
    }

    #[test]
    fn provider_contract_errors_are_deterministic() {
        for reason in [
            "unknown flag: --verbose",
            "provider contract mismatch: unsupported argument --stream-json",
            "invalid schema for response_format",
        ] {
            assert_eq!(
                classify_failure(&fail(reason)),
                FailureClass::Deterministic,
                "{reason}"
            );
        }
    }

    #[test]
    fn network_and_timeout_are_transient() {
        for reason in [
            "request timeout after 30s",
            "connection reset by peer",
            "429 too many requests",
            "HTTP 503 service unavailable",
        ] {
            let out = Outcome {
                status: OutcomeStatus::Retry,
                failure_reason: reason.to_string(),
                meta: Default::default(),
            };
            assert_eq!(
                classify_failure(&out),
                FailureClass::TransientInfra,
                "{reason}"
            );
        }
    }

    #[test]
    fn deterministic_markers_take_priority_over_transient() {
        // Both marker families present; deterministic wins.
        let out = fail("unknown flag: --timeout");
        assert_eq!(classify_failure(&out), FailureClass::Deterministic);
    }

    #[test]
    fn signature_stable_for_equivalent_reasons() {
        let a = fail("Unknown flag: --verbose");
        let b = fail("unknown    flag: --verbose   ");
        let sig_a = failure_signature(&a);
        let sig_b = failure_signature(&b);
        assert_eq!(sig_a.len(), 24);
        assert!(sig_a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn signature_differs_across_classes() {
        let det = fail("unknown flag: --x");
        let transient = fail("connection reset by peer");
        assert_ne!(failure_signature(&det), failure_signature(&transient));
    }

    #[test]
    fn retry_predicate() {
        assert!(should_retry(&fail("request timed out")));
        assert!(!should_retry(&fail("unknown flag: --x")));
        let mut success = Outcome::success();
        success.failure_reason = "timed out".into();
        assert!(!should_retry(&success));
    }
}
