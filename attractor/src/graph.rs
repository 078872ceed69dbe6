//! Graph model: typed nodes, conditional edges, graph-level attributes.
//!
//! The graph is immutable once built. Per-run mutable state (retry budgets,
//! visit counts, the current node) lives in the scheduler, never here. The
//! DOT-dialect parser is an external collaborator; it targets
//! [`GraphBuilder`].

use rustc_hash::FxHashMap;

/// Node shape, the discriminator for the executor that runs the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeShape {
    /// `Mdiamond` — the start marker. Structural; never executed for effect.
    Start,
    /// `Msquare` — the exit marker. Resolves the run's final status.
    Exit,
    /// `box` — an LLM CLI invocation.
    LlmCli,
    /// `parallelogram` — a shell command.
    Shell,
    /// `tripleoctagon` — an explicit fan-in join point.
    Join,
    /// Any other shape string; routed to the identity handler.
    Other,
}

impl NodeShape {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Mdiamond" => NodeShape::Start,
            "Msquare" => NodeShape::Exit,
            "box" => NodeShape::LlmCli,
            "parallelogram" => NodeShape::Shell,
            "tripleoctagon" => NodeShape::Join,
            _ => NodeShape::Other,
        }
    }
}

/// A node definition: immutable id, shape, and free-form attributes
/// (`prompt`, `llm_provider`, `llm_model`, `tool_command`, `max_retry`, …).
#[derive(Debug, Clone)]
pub struct NodeDef {
    pub id: String,
    pub shape: NodeShape,
    pub attrs: FxHashMap<String, String>,
}

impl NodeDef {
    /// Attribute lookup with a default for absent keys.
    pub fn attr<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.attrs.get(key).map(String::as_str).unwrap_or(default)
    }

    pub fn attr_opt(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// A directed edge with an optional `outcome=<value>` condition.
/// Edges without a condition are unconditional fallbacks.
#[derive(Debug, Clone)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    pub condition: Option<String>,
}

impl EdgeDef {
    /// The `<value>` of an `outcome=<value>` condition, if that is the form.
    pub fn outcome_condition(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .and_then(|c| c.trim().strip_prefix("outcome="))
            .map(str::trim)
    }
}

/// An immutable directed graph with document-ordered edges.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: FxHashMap<String, NodeDef>,
    edges: Vec<EdgeDef>,
    attrs: FxHashMap<String, String>,
    // node id -> indexes into `edges`, in insertion (document) order
    outgoing: FxHashMap<String, Vec<usize>>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.values()
    }

    /// Outgoing edges of `id` in document order.
    pub fn outgoing(&self, id: &str) -> Vec<&EdgeDef> {
        self.outgoing
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Graph-level attribute (`goal`, `retry_target`, `default_max_retry`, …).
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn goal(&self) -> &str {
        self.attr("goal").unwrap_or("")
    }

    pub fn retry_target(&self) -> Option<&str> {
        self.attr("retry_target").filter(|s| !s.trim().is_empty())
    }

    pub fn default_max_retry(&self) -> u32 {
        self.attr("default_max_retry")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRY)
    }

    pub fn find_start(&self) -> Option<&NodeDef> {
        self.nodes.values().find(|n| n.shape == NodeShape::Start)
    }

    pub fn find_exit(&self) -> Option<&NodeDef> {
        self.nodes.values().find(|n| n.shape == NodeShape::Exit)
    }
}

pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Builder consumed by the graph parser (and by tests).
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn graph_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.graph.attrs.insert(key.into(), value.into());
        self
    }

    pub fn node(mut self, id: impl Into<String>, shape: NodeShape) -> Self {
        let id = id.into();
        self.graph.nodes.insert(
            id.clone(),
            NodeDef {
                id,
                shape,
                attrs: FxHashMap::default(),
            },
        );
        self
    }

    pub fn node_with_attrs<I, K, V>(mut self, id: impl Into<String>, shape: NodeShape, attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let id = id.into();
        let attrs = attrs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.graph.nodes.insert(
            id.clone(),
            NodeDef {
                id,
                shape,
                attrs,
            },
        );
        self
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge_inner(from.into(), to.into(), None)
    }

    pub fn edge_if(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.edge_inner(from.into(), to.into(), Some(condition.into()))
    }

    fn edge_inner(mut self, from: String, to: String, condition: Option<String>) -> Self {
        let idx = self.graph.edges.len();
        self.graph
            .outgoing
            .entry(from.clone())
            .or_default()
            .push(idx);
        self.graph.edges.push(EdgeDef {
            from,
            to,
            condition,
        });
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}
