//! Engine error taxonomy.
//!
//! Domain failures (a node's tool exiting non-zero) never appear here; they
//! travel inside [`crate::outcome::Outcome`]. These are the infrastructure
//! errors that abort an operation or, when the scheduler cannot route
//! around them, the run.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("operation aborted: {0}")]
    #[diagnostic(code(attractor::cancelled))]
    Cancelled(String),

    #[error("request to {provider} timed out: {detail}")]
    #[diagnostic(code(attractor::timeout))]
    Timeout { provider: String, detail: String },

    #[error("not found: {0}")]
    #[diagnostic(code(attractor::not_found))]
    NotFound(String),

    #[error("routing gap at node {node_id}: no edge matches outcome {status} and no retry_target applies")]
    #[diagnostic(
        code(attractor::routing_gap),
        help("Add an unconditional fallback edge, a matching outcome edge, or a graph-level retry_target.")
    )]
    RoutingGap { node_id: String, status: String },

    #[error("invariant violated: {0}")]
    #[diagnostic(code(attractor::invariant))]
    Invariant(String),

    #[error("configuration error: {0}")]
    #[diagnostic(code(attractor::config))]
    Config(String),

    #[error("preflight failed: {0}")]
    #[diagnostic(code(attractor::preflight))]
    Preflight(String),

    #[error(transparent)]
    #[diagnostic(code(attractor::cxdb))]
    Cxdb(#[from] cxdb::CxdbError),

    #[error(transparent)]
    #[diagnostic(code(attractor::http))]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    #[diagnostic(code(attractor::io))]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    #[diagnostic(code(attractor::serde))]
    Serde(#[from] serde_json::Error),

    #[error("worker panicked or was aborted: {0}")]
    #[diagnostic(code(attractor::join))]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Uniform mapping for adapter-level I/O failures: cancellation becomes
    /// an abort, a missed deadline becomes a provider timeout, everything
    /// else passes through.
    pub fn wrap_adapter(provider: &str, err: EngineError) -> EngineError {
        match err {
            EngineError::Cancelled(msg) => EngineError::Cancelled(msg),
            EngineError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => EngineError::Timeout {
                provider: provider.to_string(),
                detail: e.to_string(),
            },
            other => other,
        }
    }
}
