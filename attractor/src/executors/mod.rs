//! Node executors.
//!
//! Each node shape maps to a handler with one contract: given an
//! [`Execution`], return an [`Outcome`]. `Err` is reserved for
//! infrastructural failures (bad configuration, unreachable services);
//! a tool that ran and failed is a domain failure carried in the outcome.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::context::RunContext;
use crate::error::EngineError;
use crate::graph::{Graph, NodeDef, NodeShape};
use crate::outcome::Outcome;
use crate::progress::ProgressLog;

mod fan_in;
mod llm;
mod shell;
mod structural;

pub use fan_in::{aggregate_branches, BranchResult, FanInHandler};
pub use llm::{is_state_db_discrepancy, state_db_max_retries, LlmCliHandler};
pub use shell::ShellHandler;
pub use structural::IdentityHandler;

/// Everything a handler may need to run one node.
#[derive(Clone)]
pub struct Execution {
    pub run_id: String,
    pub node: NodeDef,
    pub graph: Arc<Graph>,
    pub config: Arc<RunConfig>,
    pub context: RunContext,
    pub worktree: PathBuf,
    /// Exported to node subprocesses as `KILROY_LOGS_ROOT`.
    pub logs_root: Option<PathBuf>,
    pub progress: ProgressLog,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, exec: &Execution) -> Result<Outcome, EngineError>;
}

/// Shape → handler table. The default wiring covers every shape; tests may
/// substitute handlers for determinism.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: FxHashMap<NodeShape, Arc<dyn NodeHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut handlers: FxHashMap<NodeShape, Arc<dyn NodeHandler>> = FxHashMap::default();
        handlers.insert(NodeShape::LlmCli, Arc::new(LlmCliHandler::default()));
        handlers.insert(NodeShape::Shell, Arc::new(ShellHandler));
        handlers.insert(NodeShape::Join, Arc::new(FanInHandler));
        handlers.insert(NodeShape::Start, Arc::new(IdentityHandler));
        handlers.insert(NodeShape::Exit, Arc::new(IdentityHandler));
        handlers.insert(NodeShape::Other, Arc::new(IdentityHandler));
        Self { handlers }
    }
}

impl HandlerRegistry {
    pub fn with_handler(mut self, shape: NodeShape, handler: Arc<dyn NodeHandler>) -> Self {
        self.handlers.insert(shape, handler);
        self
    }

    pub fn handler_for(&self, shape: NodeShape) -> Result<Arc<dyn NodeHandler>, EngineError> {
        self.handlers
            .get(&shape)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("no handler registered for {shape:?}")))
    }
}
