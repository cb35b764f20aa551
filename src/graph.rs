//! The process graph: authoring definition, indexed runtime form, and
//! structural validation.
//!
//! A [`GraphDefinition`] is plain authorable data (YAML or JSON). Building a
//! [`ProcessGraph`] from it computes the lookup indices once; edges reference
//! nodes by id, so there are no back-pointers to manage. Graphs are read-only
//! at runtime and shared by every instance that references them.

use crate::expression::ExpressionEvaluator;
use crate::types::{Edge, EdgeId, ExecutionSemantics, Node, NodeId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

// ─── Status ───────────────────────────────────────────────────

/// Graph lifecycle. Only validated graphs may be published.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphStatus {
    Draft,
    Published,
    Deprecated,
}

// ─── Authoring definition ─────────────────────────────────────

/// Authorable form of a process graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub id: String,
    #[serde(default = "GraphDefinition::default_version")]
    pub version: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub entry_node_ids: Vec<NodeId>,
    pub terminal_node_ids: Vec<NodeId>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphDefinition {
    fn default_version() -> u32 {
        1
    }

    /// Parse a YAML graph definition.
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }
}

// ─── Validation defects ───────────────────────────────────────

/// One structural defect found by [`ProcessGraph::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct GraphDefect {
    pub message: String,
    pub element_id: Option<String>,
}

impl GraphDefect {
    fn new(message: impl Into<String>, element_id: Option<&str>) -> Self {
        Self {
            message: message.into(),
            element_id: element_id.map(str::to_string),
        }
    }
}

impl std::fmt::Display for GraphDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.element_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

// ─── Runtime graph ────────────────────────────────────────────

/// Indexed, immutable runtime form of a process graph.
///
/// Outbound/inbound edge lists are pre-sorted by priority weight descending,
/// rank ascending, edge id ascending, so every traversal observes the same
/// total order.
#[derive(Clone, Debug)]
pub struct ProcessGraph {
    definition: GraphDefinition,
    status: GraphStatus,
    node_index: HashMap<NodeId, usize>,
    edge_index: HashMap<EdgeId, usize>,
    outbound: HashMap<NodeId, Vec<usize>>,
    inbound: HashMap<NodeId, Vec<usize>>,
    nodes_by_event: HashMap<String, Vec<NodeId>>,
    edges_by_event: HashMap<String, Vec<usize>>,
}

impl ProcessGraph {
    /// Build the indexed graph from its definition. Dangling references are
    /// tolerated here and reported by [`Self::validate`].
    pub fn from_definition(definition: GraphDefinition) -> Self {
        let mut node_index = HashMap::new();
        for (i, node) in definition.nodes.iter().enumerate() {
            node_index.entry(node.id.clone()).or_insert(i);
        }

        let mut edge_index = HashMap::new();
        let mut outbound: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut inbound: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut edges_by_event: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in definition.edges.iter().enumerate() {
            edge_index.entry(edge.id.clone()).or_insert(i);
            outbound.entry(edge.source_node_id.clone()).or_default().push(i);
            inbound.entry(edge.target_node_id.clone()).or_default().push(i);
            for ev in &edge.activating_events {
                edges_by_event.entry(ev.clone()).or_default().push(i);
            }
        }

        let mut nodes_by_event: HashMap<String, Vec<NodeId>> = HashMap::new();
        for node in &definition.nodes {
            for ev in &node.events.subscribes {
                nodes_by_event.entry(ev.clone()).or_default().push(node.id.clone());
            }
        }

        let sort_key = |edges: &[Edge], i: usize| {
            let e = &edges[i];
            (-e.priority.weight, e.priority.rank, e.id.clone())
        };
        for list in outbound.values_mut().chain(inbound.values_mut()) {
            list.sort_by_key(|&i| sort_key(&definition.edges, i));
        }

        Self {
            definition,
            status: GraphStatus::Draft,
            node_index,
            edge_index,
            outbound,
            inbound,
            nodes_by_event,
            edges_by_event,
        }
    }

    // ── Accessors ──

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn status(&self) -> GraphStatus {
        self.status
    }

    /// The authorable definition this graph was built from. Persistence
    /// backends store this and rebuild with [`ProcessGraph::from_definition`].
    pub fn definition(&self) -> &GraphDefinition {
        &self.definition
    }

    pub fn nodes(&self) -> &[Node] {
        &self.definition.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.definition.edges
    }

    pub fn entry_node_ids(&self) -> &[NodeId] {
        &self.definition.entry_node_ids
    }

    pub fn terminal_node_ids(&self) -> &[NodeId] {
        &self.definition.terminal_node_ids
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.definition.nodes[i])
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edge_index.get(id).map(|&i| &self.definition.edges[i])
    }

    pub fn is_terminal_node(&self, id: &str) -> bool {
        self.definition.terminal_node_ids.iter().any(|t| t == id)
    }

    /// Outbound edges of `node_id`, highest priority first.
    pub fn outbound_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.outbound
            .get(node_id)
            .map(|ids| ids.iter().map(|&i| &self.definition.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Inbound edges of `node_id`, highest priority first.
    pub fn inbound_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.inbound
            .get(node_id)
            .map(|ids| ids.iter().map(|&i| &self.definition.edges[i]).collect())
            .unwrap_or_default()
    }

    /// The parallel fan-in group of `node_id`: inbound edges with parallel
    /// execution semantics.
    pub fn parallel_inbound_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.inbound_edges(node_id)
            .into_iter()
            .filter(|e| e.semantics.is_parallel())
            .collect()
    }

    pub fn nodes_subscribed_to(&self, event_type: &str) -> Vec<&Node> {
        self.nodes_by_event
            .get(event_type)
            .map(|ids| ids.iter().filter_map(|id| self.node(id)).collect())
            .unwrap_or_default()
    }

    pub fn edges_activated_by(&self, event_type: &str) -> Vec<&Edge> {
        self.edges_by_event
            .get(event_type)
            .map(|ids| ids.iter().map(|&i| &self.definition.edges[i]).collect())
            .unwrap_or_default()
    }

    // ── Lifecycle ──

    /// Validate and flip the graph to `PUBLISHED`. Fails with the ordered
    /// defect list when validation finds anything.
    pub fn publish(
        &mut self,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<(), Vec<GraphDefect>> {
        let defects = self.validate(evaluator);
        if defects.is_empty() {
            self.status = GraphStatus::Published;
            Ok(())
        } else {
            Err(defects)
        }
    }

    pub fn deprecate(&mut self) {
        self.status = GraphStatus::Deprecated;
    }

    // ── Validation ──

    /// Structural validation. Returns an ordered defect list; empty means
    /// the graph is publishable.
    pub fn validate(&self, evaluator: &dyn ExpressionEvaluator) -> Vec<GraphDefect> {
        let mut defects = Vec::new();
        let def = &self.definition;

        // 1. Duplicate ids
        let mut seen = HashSet::new();
        for node in &def.nodes {
            if !seen.insert(node.id.as_str()) {
                defects.push(GraphDefect::new("duplicate node id", Some(&node.id)));
            }
        }
        let mut seen = HashSet::new();
        for edge in &def.edges {
            if !seen.insert(edge.id.as_str()) {
                defects.push(GraphDefect::new("duplicate edge id", Some(&edge.id)));
            }
        }

        // 2. Dangling references
        for edge in &def.edges {
            if self.node(&edge.source_node_id).is_none() {
                defects.push(GraphDefect::new(
                    format!("edge source `{}` does not resolve to a node", edge.source_node_id),
                    Some(&edge.id),
                ));
            }
            if self.node(&edge.target_node_id).is_none() {
                defects.push(GraphDefect::new(
                    format!("edge target `{}` does not resolve to a node", edge.target_node_id),
                    Some(&edge.id),
                ));
            }
        }
        for id in &def.entry_node_ids {
            if self.node(id).is_none() {
                defects.push(GraphDefect::new("entry node id does not resolve", Some(id)));
            }
        }
        for id in &def.terminal_node_ids {
            if self.node(id).is_none() {
                defects.push(GraphDefect::new("terminal node id does not resolve", Some(id)));
            }
        }
        for node in &def.nodes {
            for route in &node.exception_routes {
                if self.node(&route.target_node_id).is_none() {
                    defects.push(GraphDefect::new(
                        format!(
                            "exception route target `{}` does not resolve to a node",
                            route.target_node_id
                        ),
                        Some(&node.id),
                    ));
                }
            }
        }

        // 3. Entry set and edges out of terminals
        if def.entry_node_ids.is_empty() {
            defects.push(GraphDefect::new("graph declares no entry nodes", None));
        }
        for id in &def.terminal_node_ids {
            if !self.outbound_edges(id).is_empty() {
                defects.push(GraphDefect::new("terminal node has outbound edges", Some(id)));
            }
        }

        // 4. Reachability from the entry set
        defects.extend(self.unreachable_nodes().into_iter().map(|id| {
            GraphDefect::new("node is unreachable from every entry node", Some(&id))
        }));

        // 5. Join arity sanity
        for edge in &def.edges {
            if let ExecutionSemantics::Parallel { join } = edge.semantics {
                if let crate::types::JoinType::NOfM { n } = join {
                    let group = self.parallel_inbound_edges(&edge.target_node_id).len() as u32;
                    if n == 0 || n > group {
                        defects.push(GraphDefect::new(
                            format!("join N_OF_M with n={n} but fan-in group has {group} edges"),
                            Some(&edge.id),
                        ));
                    }
                }
            }
        }

        // 6. Guard expressions must dry-parse
        for node in &def.nodes {
            for expr in &node.preconditions {
                if let Err(e) = evaluator.dry_parse(expr) {
                    defects.push(GraphDefect::new(
                        format!("malformed precondition: {e}"),
                        Some(&node.id),
                    ));
                }
            }
            for rule in &node.rules {
                if let Err(e) = evaluator.dry_parse(&rule.expression) {
                    defects.push(GraphDefect::new(
                        format!("malformed rule `{}`: {e}", rule.id),
                        Some(&node.id),
                    ));
                }
            }
            for gate in &node.policy_gates {
                if let Err(e) = evaluator.dry_parse(&gate.expression) {
                    defects.push(GraphDefect::new(
                        format!("malformed policy gate `{}`: {e}", gate.id),
                        Some(&node.id),
                    ));
                }
            }
        }
        for edge in &def.edges {
            for expr in &edge.guards.context {
                if let Err(e) = evaluator.dry_parse(expr) {
                    defects.push(GraphDefect::new(
                        format!("malformed context guard: {e}"),
                        Some(&edge.id),
                    ));
                }
            }
        }

        defects
    }

    /// Node ids not reachable from any entry node, in definition order.
    fn unreachable_nodes(&self) -> Vec<NodeId> {
        let def = &self.definition;
        if def.entry_node_ids.is_empty() {
            return Vec::new();
        }

        let mut pg: DiGraph<(), ()> = DiGraph::new();
        let mut idx: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &def.nodes {
            idx.insert(node.id.as_str(), pg.add_node(()));
        }
        for edge in &def.edges {
            if let (Some(&s), Some(&t)) = (
                idx.get(edge.source_node_id.as_str()),
                idx.get(edge.target_node_id.as_str()),
            ) {
                pg.add_edge(s, t, ());
            }
        }

        let mut reached: HashSet<NodeIndex> = HashSet::new();
        for entry in &def.entry_node_ids {
            if let Some(&start) = idx.get(entry.as_str()) {
                let mut dfs = Dfs::new(&pg, start);
                while let Some(n) = dfs.next(&pg) {
                    reached.insert(n);
                }
            }
        }

        def.nodes
            .iter()
            .filter(|n| idx.get(n.id.as_str()).map(|i| !reached.contains(i)).unwrap_or(true))
            .map(|n| n.id.clone())
            .collect()
    }
}
