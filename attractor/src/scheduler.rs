//! Graph scheduler: edge routing, restart policy, implicit fan-out/join.
//!
//! The graph itself is immutable; everything mutable for one run (current
//! node, retry budgets, branch frames) lives in the chain-local state of
//! [`Scheduler::run`]. Transient failures restart the failing node in
//! place while its budget lasts; deterministic failures route through
//! `outcome=fail` edges or the graph-level `retry_target`. A fail outcome
//! with nowhere to go is a routing gap and terminates the run with an
//! error, never silently.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tracing::instrument;

use crate::classify::should_retry;
use crate::context::{RunContext, PARALLEL_RESULTS_KEY};
use crate::error::EngineError;
use crate::executors::{aggregate_branches, BranchResult, Execution, HandlerRegistry};
use crate::graph::{EdgeDef, Graph, NodeShape};
use crate::outcome::{FinalStatus, Outcome, OutcomeStatus};
use crate::progress::ProgressLog;
use crate::sink::{CxdbSink, NODE_EXECUTION_TYPE_ID};

/// Immutable inputs shared by every chain of one run.
#[derive(Clone)]
pub struct RunInputs {
    pub graph: Arc<Graph>,
    pub config: Arc<crate::config::RunConfig>,
    pub run_id: String,
    pub worktree: std::path::PathBuf,
    pub logs_root: Option<std::path::PathBuf>,
    pub progress: ProgressLog,
    pub cancel: tokio_util::sync::CancellationToken,
}

#[derive(Debug)]
pub struct ScheduleResult {
    pub final_status: FinalStatus,
    pub last_outcome: Outcome,
    pub completed_nodes: Vec<String>,
}

#[derive(Clone)]
pub struct Scheduler {
    registry: HandlerRegistry,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            registry: HandlerRegistry::default(),
        }
    }
}

impl Scheduler {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Drive the graph from its start node to terminal resolution.
    #[instrument(skip(self, inputs, sink, context), fields(run_id = %inputs.run_id), err)]
    pub async fn run(
        &self,
        inputs: &RunInputs,
        context: RunContext,
        sink: Option<Arc<CxdbSink>>,
    ) -> Result<ScheduleResult, EngineError> {
        let start = inputs
            .graph
            .find_start()
            .ok_or_else(|| EngineError::NotFound("graph has no start node".into()))?
            .id
            .clone();
        let chain = self
            .run_chain(inputs.clone(), context, sink, start, None)
            .await?;
        let final_status = if chain.last_outcome.status == OutcomeStatus::Success {
            FinalStatus::Success
        } else {
            FinalStatus::Fail
        };
        Ok(ScheduleResult {
            final_status,
            last_outcome: chain.last_outcome,
            completed_nodes: chain.completed,
        })
    }

    /// Execute nodes sequentially from `current` until the exit node, a
    /// `stop_at` boundary (the join of an enclosing fan-out), or a node
    /// with no outgoing edges.
    fn run_chain(
        &self,
        inputs: RunInputs,
        context: RunContext,
        sink: Option<Arc<CxdbSink>>,
        mut current: String,
        stop_at: Option<String>,
    ) -> BoxFuture<'static, Result<ChainResult, EngineError>> {
        let scheduler = self.clone();
        Box::pin(async move {
            let mut retries: FxHashMap<String, u32> = FxHashMap::default();
            let mut completed: Vec<String> = Vec::new();
            let mut last_outcome = Outcome::success();
            // Set when a fan-out aggregate already decided the join node's
            // outcome, so the join body must not execute again.
            let mut pending_outcome: Option<Outcome> = None;

            loop {
                if inputs.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled(format!(
                        "run {} cancelled at node {current}",
                        inputs.run_id
                    )));
                }
                if stop_at.as_deref() == Some(current.as_str()) {
                    return Ok(ChainResult {
                        last_outcome,
                        completed,
                    });
                }
                let node = inputs
                    .graph
                    .node(&current)
                    .ok_or_else(|| EngineError::NotFound(format!("node not found: {current}")))?
                    .clone();
                if node.shape == NodeShape::Exit && stop_at.is_none() {
                    // Terminal resolution: the exit node reports the outcome
                    // that reached it.
                    return Ok(ChainResult {
                        last_outcome,
                        completed,
                    });
                }

                let outcome = match pending_outcome.take() {
                    Some(outcome) => outcome,
                    None => {
                        scheduler
                            .execute_node(&inputs, &context, sink.as_ref(), &node)
                            .await?
                    }
                };

                // Restart policy: transient infrastructure failures re-enter
                // the same node while its budget lasts.
                let budget = max_retry_for(&inputs.graph, &node.id);
                if should_retry(&outcome) && retries.get(&node.id).copied().unwrap_or(0) < budget {
                    let attempt = retries.entry(node.id.clone()).or_insert(0);
                    *attempt += 1;
                    inputs.progress.event(
                        "node_retry",
                        [
                            ("node_id", Value::String(node.id.clone())),
                            ("attempt", Value::from(*attempt)),
                        ],
                    );
                    continue;
                }

                completed.push(node.id.clone());
                last_outcome = outcome.clone();

                // Edge selection: condition matches first, then
                // unconditional fallbacks, in document order.
                let edges = inputs.graph.outgoing(&current);
                if edges.is_empty() {
                    return Ok(ChainResult {
                        last_outcome,
                        completed,
                    });
                }
                let matching: Vec<&EdgeDef> = edges
                    .iter()
                    .copied()
                    .filter(|e| {
                        e.outcome_condition()
                            .is_some_and(|v| outcome.status.matches_condition(v))
                    })
                    .collect();
                let condition_matched = !matching.is_empty();
                let eligible: Vec<&EdgeDef> = if condition_matched {
                    matching
                } else {
                    edges
                        .iter()
                        .copied()
                        .filter(|e| e.condition.is_none())
                        .collect()
                };

                // Multiple condition matches tie-break to document order;
                // multiple unconditional edges are a branch start.
                if eligible.len() > 1 && condition_matched {
                    current = eligible[0].to.clone();
                    continue;
                }

                match eligible.len() {
                    0 => {
                        // No route. Fail outcomes may fall back to the
                        // graph-level retry target before this becomes a gap.
                        if outcome.status != OutcomeStatus::Success {
                            if let Some(target) = inputs.graph.retry_target() {
                                if inputs.graph.node(target).is_some() {
                                    let target_budget = max_retry_for(&inputs.graph, target);
                                    let entries = retries.entry(target.to_string()).or_insert(0);
                                    if *entries < target_budget.max(1) {
                                        *entries += 1;
                                        inputs.progress.event(
                                            "retry_target",
                                            [
                                                ("from", Value::String(current.clone())),
                                                ("to", Value::String(target.to_string())),
                                            ],
                                        );
                                        current = target.to_string();
                                        continue;
                                    }
                                }
                            }
                        }
                        return Err(EngineError::RoutingGap {
                            node_id: current,
                            status: outcome.status.as_str().to_string(),
                        });
                    }
                    1 => {
                        current = eligible[0].to.clone();
                    }
                    _ => {
                        // Implicit fan-out: one worker per branch, each in a
                        // CXDB fork, reduced at the join node.
                        let branch_edges: Vec<EdgeDef> =
                            eligible.into_iter().cloned().collect();
                        let join = find_join_node(&inputs.graph, &branch_edges)?;
                        let results = scheduler
                            .run_branches(&inputs, &context, sink.as_ref(), &branch_edges, &join)
                            .await?;
                        context.set(PARALLEL_RESULTS_KEY, serde_json::to_value(&results)?);

                        let join_node = inputs.graph.node(&join).ok_or_else(|| {
                            EngineError::NotFound(format!("join node not found: {join}"))
                        })?;
                        if join_node.shape != NodeShape::Join {
                            // Box convergence: the reduction happens here and
                            // the box body runs only when every branch
                            // succeeded.
                            let aggregate = aggregate_branches(&results);
                            if aggregate.status != OutcomeStatus::Success {
                                pending_outcome = Some(aggregate);
                            }
                        }
                        current = join;
                    }
                }
            }
        })
    }

    async fn execute_node(
        &self,
        inputs: &RunInputs,
        context: &RunContext,
        sink: Option<&Arc<CxdbSink>>,
        node: &crate::graph::NodeDef,
    ) -> Result<Outcome, EngineError> {
        inputs.progress.event(
            "node_started",
            [
                ("node_id", Value::String(node.id.clone())),
                ("state", Value::String("running".into())),
            ],
        );

        let handler = self.registry.handler_for(node.shape)?;
        let exec = Execution {
            run_id: inputs.run_id.clone(),
            node: node.clone(),
            graph: inputs.graph.clone(),
            config: inputs.config.clone(),
            context: context.clone(),
            worktree: inputs.worktree.clone(),
            logs_root: inputs.logs_root.clone(),
            progress: inputs.progress.clone(),
            cancel: inputs.cancel.clone(),
        };
        let outcome = handler.execute(&exec).await?;

        let mut finished = Map::new();
        finished.insert("event".into(), Value::String("node_finished".into()));
        finished.insert("node_id".into(), Value::String(node.id.clone()));
        finished.insert(
            "status".into(),
            Value::String(outcome.status.as_str().into()),
        );
        if !outcome.failure_reason.is_empty() {
            finished.insert(
                "failure_reason".into(),
                Value::String(outcome.failure_reason.clone()),
            );
        }
        inputs.progress.append(&finished);

        if let Some(sink) = sink {
            if matches!(
                node.shape,
                NodeShape::LlmCli | NodeShape::Shell | NodeShape::Join
            ) {
                let mut data = Map::new();
                data.insert("run_id".into(), Value::String(inputs.run_id.clone()));
                data.insert("node_id".into(), Value::String(node.id.clone()));
                data.insert(
                    "status".into(),
                    Value::String(outcome.status.as_str().into()),
                );
                if !outcome.failure_reason.is_empty() {
                    data.insert(
                        "failure_reason".into(),
                        Value::String(outcome.failure_reason.clone()),
                    );
                }
                if !outcome.meta.is_empty() {
                    data.insert("meta".into(), serde_json::to_value(&outcome.meta)?);
                }
                sink.append(NODE_EXECUTION_TYPE_ID, 1, data).await?;
            }
        }
        Ok(outcome)
    }

    /// Run each branch concurrently in its own worker with an isolated
    /// context and a CXDB context forked from the pre-branch head.
    async fn run_branches(
        &self,
        inputs: &RunInputs,
        context: &RunContext,
        sink: Option<&Arc<CxdbSink>>,
        branch_edges: &[EdgeDef],
        join: &str,
    ) -> Result<Vec<BranchResult>, EngineError> {
        inputs.progress.event(
            "fan_out",
            [
                (
                    "branches",
                    Value::from(
                        branch_edges
                            .iter()
                            .map(|e| Value::String(e.to.clone()))
                            .collect::<Vec<_>>(),
                    ),
                ),
                ("join", Value::String(join.to_string())),
            ],
        );

        let mut workers = Vec::with_capacity(branch_edges.len());
        for edge in branch_edges {
            let branch_sink = match sink {
                Some(s) => Some(Arc::new(s.fork_from_head().await?)),
                None => None,
            };
            // Branch contexts start from a snapshot of the parent so nested
            // fan-outs cannot clobber each other's results.
            let branch_context = RunContext::new();
            for (k, v) in context.snapshot() {
                branch_context.set(k, v);
            }
            let scheduler = self.clone();
            let inputs = inputs.clone();
            let entry = edge.to.clone();
            let join = join.to_string();
            workers.push(tokio::spawn(async move {
                let result = scheduler
                    .run_chain(inputs, branch_context, branch_sink, entry.clone(), Some(join))
                    .await;
                (entry, result)
            }));
        }

        let mut results = Vec::with_capacity(workers.len());
        for worker in workers {
            let (entry, result) = worker.await?;
            let chain = result?;
            results.push(BranchResult {
                branch_key: entry,
                outcome: chain.last_outcome,
            });
        }
        inputs.progress.event(
            "fan_in",
            [("join", Value::String(join.to_string()))],
        );
        Ok(results)
    }
}

struct ChainResult {
    last_outcome: Outcome,
    completed: Vec<String>,
}

fn max_retry_for(graph: &Graph, node_id: &str) -> u32 {
    graph
        .node(node_id)
        .and_then(|n| n.attr_opt("max_retry"))
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or_else(|| graph.default_max_retry())
}

/// Identify the join node of an implicit fan-out.
///
/// Prefers a `tripleoctagon` reachable from every branch; otherwise the
/// earliest common downstream `box` ("box convergence"). Errors when
/// there are no branches or no join can be identified.
pub fn find_join_node(graph: &Graph, branch_edges: &[EdgeDef]) -> Result<String, EngineError> {
    if branch_edges.is_empty() {
        return Err(EngineError::Config(
            "fan-out has no branch edges".into(),
        ));
    }

    let mut common: Option<HashSet<String>> = None;
    for edge in branch_edges {
        let reachable = reachable_from(graph, &edge.to);
        common = Some(match common {
            None => reachable,
            Some(prev) => prev.intersection(&reachable).cloned().collect(),
        });
    }
    let common = common.unwrap_or_default();

    // BFS order from the first branch gives "earliest downstream".
    let order = bfs_order(graph, &branch_edges[0].to);
    if let Some(join) = order.iter().find(|id| {
        common.contains(*id)
            && graph.node(id).map(|n| n.shape) == Some(NodeShape::Join)
    }) {
        return Ok(join.clone());
    }
    if let Some(join) = order.iter().find(|id| {
        common.contains(*id)
            && graph.node(id).map(|n| n.shape) == Some(NodeShape::LlmCli)
    }) {
        return Ok(join.clone());
    }
    Err(EngineError::Config(
        "fan-out has no identifiable join node".into(),
    ))
}

fn reachable_from(graph: &Graph, start: &str) -> HashSet<String> {
    bfs_order(graph, start).into_iter().collect()
}

fn bfs_order(graph: &Graph, start: &str) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(start.to_string());
    seen.insert(start.to_string());
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        for edge in graph.outgoing(&id) {
            if seen.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::graph::NodeShape;
    use tokio_util::sync::CancellationToken;

    fn llm_attrs() -> [(&'static str, &'static str); 2] {
        [("llm_provider", "openai"), ("llm_model", "gpt-5")]
    }

    fn fanout_graph(with_join: bool) -> Graph {
        let mut b = Graph::builder()
            .graph_attr("goal", "test")
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs("a", NodeShape::LlmCli, llm_attrs())
            .node_with_attrs("b", NodeShape::LlmCli, llm_attrs())
            .node_with_attrs("synth", NodeShape::LlmCli, llm_attrs());
        if with_join {
            b = b
                .node("join", NodeShape::Join)
                .edge("start", "a")
                .edge("start", "b")
                .edge("a", "join")
                .edge("b", "join")
                .edge("join", "synth")
                .edge("synth", "exit");
        } else {
            b = b
                .edge("start", "a")
                .edge("start", "b")
                .edge("a", "synth")
                .edge("b", "synth")
                .edge("synth", "exit");
        }
        b.build()
    }

    fn branch_edges(graph: &Graph, from: &str) -> Vec<EdgeDef> {
        graph.outgoing(from).into_iter().cloned().collect()
    }

    #[test]
    fn find_join_prefers_tripleoctagon() {
        let g = fanout_graph(true);
        let join = find_join_node(&g, &branch_edges(&g, "start")).unwrap();
        assert_eq!(join, "join");
    }

    #[test]
    fn find_join_falls_back_to_box_convergence() {
        let g = fanout_graph(false);
        let join = find_join_node(&g, &branch_edges(&g, "start")).unwrap();
        assert_eq!(join, "synth");
    }

    #[test]
    fn find_join_errors_without_branches() {
        let g = fanout_graph(true);
        assert!(find_join_node(&g, &[]).is_err());
    }

    #[test]
    fn find_join_errors_without_convergence() {
        let g = Graph::builder()
            .node("start", NodeShape::Start)
            .node_with_attrs("a", NodeShape::Shell, [("tool_command", "true")])
            .node_with_attrs("b", NodeShape::Shell, [("tool_command", "true")])
            .edge("start", "a")
            .edge("start", "b")
            .build();
        assert!(find_join_node(&g, &branch_edges(&g, "start")).is_err());
    }

    fn inputs_for(graph: Graph, worktree: &std::path::Path) -> RunInputs {
        RunInputs {
            graph: Arc::new(graph),
            config: Arc::new(RunConfig::default()),
            run_id: "test-run".into(),
            worktree: worktree.to_path_buf(),
            logs_root: None,
            progress: ProgressLog::new(None, "test-run"),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn linear_shell_graph_succeeds() {
        let wt = tempfile::tempdir().unwrap();
        let g = Graph::builder()
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs("a", NodeShape::Shell, [("tool_command", "echo ok")])
            .edge("start", "a")
            .edge("a", "exit")
            .build();
        let res = Scheduler::default()
            .run(&inputs_for(g, wt.path()), RunContext::new(), None)
            .await
            .unwrap();
        assert_eq!(res.final_status, FinalStatus::Success);
        assert_eq!(res.completed_nodes, vec!["start", "a"]);
    }

    #[tokio::test]
    async fn fail_without_matching_edge_falls_back_to_retry_target() {
        let wt = tempfile::tempdir().unwrap();
        let g = Graph::builder()
            .graph_attr("goal", "test")
            .graph_attr("retry_target", "fix")
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs(
                "review",
                NodeShape::Shell,
                [("tool_command", "echo fail; exit 1")],
            )
            .node_with_attrs(
                "fix",
                NodeShape::Shell,
                [("tool_command", "echo fixed > fixed.txt")],
            )
            .edge("start", "review")
            .edge_if("review", "exit", "outcome=yes")
            .edge_if("review", "fix", "outcome=__never__")
            .edge("fix", "exit")
            .build();
        let res = Scheduler::default()
            .run(&inputs_for(g, wt.path()), RunContext::new(), None)
            .await
            .unwrap();
        assert_eq!(res.final_status, FinalStatus::Success);
        assert!(wt.path().join("fixed.txt").exists());
    }

    #[tokio::test]
    async fn routing_gap_without_retry_target_errors() {
        let wt = tempfile::tempdir().unwrap();
        let g = Graph::builder()
            .graph_attr("goal", "test")
            .graph_attr("default_max_retry", "0")
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs(
                "review",
                NodeShape::Shell,
                [("tool_command", "echo fail; exit 1")],
            )
            .edge("start", "review")
            .edge_if("review", "exit", "outcome=yes")
            .build();
        let err = Scheduler::default()
            .run(&inputs_for(g, wt.path()), RunContext::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RoutingGap { .. }));
    }

    #[tokio::test]
    async fn fail_edge_routes_to_exit_with_final_fail() {
        let wt = tempfile::tempdir().unwrap();
        let g = Graph::builder()
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs("a", NodeShape::Shell, [("tool_command", "exit 1")])
            .edge("start", "a")
            .edge_if("a", "exit", "outcome=fail")
            .build();
        let res = Scheduler::default()
            .run(&inputs_for(g, wt.path()), RunContext::new(), None)
            .await
            .unwrap();
        assert_eq!(res.final_status, FinalStatus::Fail);
    }

    #[tokio::test]
    async fn conditional_edge_beats_unconditional_fallback() {
        let wt = tempfile::tempdir().unwrap();
        let g = Graph::builder()
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs("a", NodeShape::Shell, [("tool_command", "true")])
            .node_with_attrs("wrong", NodeShape::Shell, [("tool_command", "exit 9")])
            .edge("start", "a")
            .edge("a", "wrong")
            .edge_if("a", "exit", "outcome=yes")
            .build();
        let res = Scheduler::default()
            .run(&inputs_for(g, wt.path()), RunContext::new(), None)
            .await
            .unwrap();
        assert_eq!(res.final_status, FinalStatus::Success);
        assert!(!res.completed_nodes.contains(&"wrong".to_string()));
    }

    #[tokio::test]
    async fn shell_fanout_reduces_at_join() {
        let wt = tempfile::tempdir().unwrap();
        let g = Graph::builder()
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs("a", NodeShape::Shell, [("tool_command", "echo a > a.txt")])
            .node_with_attrs("b", NodeShape::Shell, [("tool_command", "echo b > b.txt")])
            .node("join", NodeShape::Join)
            .edge("start", "a")
            .edge("start", "b")
            .edge("a", "join")
            .edge("b", "join")
            .edge("join", "exit")
            .build();
        let res = Scheduler::default()
            .run(&inputs_for(g, wt.path()), RunContext::new(), None)
            .await
            .unwrap();
        assert_eq!(res.final_status, FinalStatus::Success);
        assert!(wt.path().join("a.txt").exists());
        assert!(wt.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn fanout_branch_failure_fails_at_join() {
        let wt = tempfile::tempdir().unwrap();
        let g = Graph::builder()
            .graph_attr("default_max_retry", "0")
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs("a", NodeShape::Shell, [("tool_command", "true")])
            .node_with_attrs("b", NodeShape::Shell, [("tool_command", "exit 1")])
            .node("join", NodeShape::Join)
            .edge("start", "a")
            .edge("start", "b")
            .edge("a", "join")
            .edge("b", "join")
            .edge("join", "exit")
            .edge_if("join", "exit", "outcome=fail")
            .build();
        let res = Scheduler::default()
            .run(&inputs_for(g, wt.path()), RunContext::new(), None)
            .await
            .unwrap();
        assert_eq!(res.final_status, FinalStatus::Fail);
        assert!(res
            .last_outcome
            .failure_reason
            .contains("branch(es) failed"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let wt = tempfile::tempdir().unwrap();
        let g = Graph::builder()
            .node("start", NodeShape::Start)
            .node("exit", NodeShape::Exit)
            .node_with_attrs("a", NodeShape::Shell, [("tool_command", "true")])
            .edge("start", "a")
            .edge("a", "exit")
            .build();
        let inputs = inputs_for(g, wt.path());
        inputs.cancel.cancel();
        let err = Scheduler::default()
            .run(&inputs, RunContext::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
    }
}
