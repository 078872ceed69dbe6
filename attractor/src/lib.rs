//! ```text
//! GraphBuilder ─► Graph ─► Engine::run
//!                          │
//!                          ├─► preflight (provider CLIs) / modeldb snapshot
//!                          ├─► Scheduler ─► NodeHandlers ─► Outcome
//!                          │                │
//!                          │                └─► ChanStream (subprocess events)
//!                          ├─► CxdbSink ─► cxdb::Client / cxdb::BinaryClient
//!                          └─► ProgressLog ─► progress.ndjson / live.json ─► stop
//! ```
//!
//! Attractor executes a directed graph whose nodes are units of work —
//! chiefly LLM CLI invocations against a repository — and whose edges
//! route on node outcomes. Every run appends its observable transitions
//! to a CXDB context as an idempotent, linearly-chained event log, mirrors
//! progress to local files, and resolves to a terminal success or fail.

pub mod classify;
pub mod config;
pub mod context;
pub mod engine;
pub mod env;
pub mod error;
pub mod executors;
pub mod graph;
pub mod modeldb;
pub mod outcome;
pub mod preflight;
pub mod progress;
pub mod runstate;
pub mod scheduler;
pub mod sink;
pub mod stream;

pub use engine::{Engine, RunOptions, RunResult};
pub use error::EngineError;
pub use graph::{Graph, GraphBuilder, NodeShape};
pub use outcome::{FinalStatus, Outcome, OutcomeStatus};
pub use scheduler::Scheduler;
