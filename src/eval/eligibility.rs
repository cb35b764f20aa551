//! Eligibility evaluation: computes the per-step [`EligibleSpace`] — every
//! candidate node and edge, evaluated, combined into candidate actions.
//!
//! Rejected evaluations are kept alongside accepted ones; they only live as
//! long as the cycle, feeding the decision trace.

use crate::context::RuntimeContext;
use crate::eval::edge::{join_satisfied, EdgeEvaluation, EdgeEvaluator};
use crate::eval::node::{NodeEvaluation, NodeEvaluator};
use crate::expression::ExpressionEvaluator;
use crate::graph::ProcessGraph;
use crate::instance::{ExecutionStatus, ProcessInstance};
use crate::types::{Compensation, Edge, EdgeId, NodeId, ENTRY_ACTION_PRIORITY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// One dispatchable pairing of a target node with the edge that reaches it
/// (`edge_id` is `None` for entry nodes and failure-routed targets).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateAction {
    pub node_id: NodeId,
    pub edge_id: Option<EdgeId>,
    pub node_evaluation: NodeEvaluation,
    pub edge_evaluation: Option<EdgeEvaluation>,
    pub effective_priority: i32,
    pub rank: i32,
    pub exclusive: bool,
    pub parallel: bool,
}

/// The candidate space computed at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EligibleSpace {
    /// Every candidate-node evaluation, accepted and rejected.
    pub eligible_nodes: Vec<NodeEvaluation>,
    /// Every candidate-edge evaluation, accepted and rejected.
    pub traversable_edges: Vec<EdgeEvaluation>,
    pub candidate_actions: Vec<CandidateAction>,
    pub evaluated_at: DateTime<Utc>,
}

impl EligibleSpace {
    pub fn is_empty(&self) -> bool {
        self.candidate_actions.is_empty()
    }
}

enum Mode<'a> {
    Normal,
    Entry,
    Event(&'a str),
}

/// Computes the eligible space from the instance, the graph, and the
/// assembled runtime context.
pub struct EligibilityEvaluator {
    nodes: NodeEvaluator,
    edges: EdgeEvaluator,
}

impl EligibilityEvaluator {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            nodes: NodeEvaluator::new(evaluator.clone()),
            edges: EdgeEvaluator::new(evaluator),
        }
    }

    /// Steady-state evaluation.
    pub fn evaluate(
        &self,
        instance: &ProcessInstance,
        graph: &ProcessGraph,
        ctx: &RuntimeContext,
    ) -> EligibleSpace {
        self.build(instance, graph, ctx, Mode::Normal)
    }

    /// Entry evaluation: only entry nodes are candidates.
    pub fn evaluate_entry(
        &self,
        instance: &ProcessInstance,
        graph: &ProcessGraph,
        ctx: &RuntimeContext,
    ) -> EligibleSpace {
        self.build(instance, graph, ctx, Mode::Entry)
    }

    /// Event-biased evaluation: the steady-state candidate sets plus event
    /// subscribers and event-activated edges.
    pub fn reevaluate_after_event(
        &self,
        instance: &ProcessInstance,
        graph: &ProcessGraph,
        ctx: &RuntimeContext,
        event_type: &str,
    ) -> EligibleSpace {
        self.build(instance, graph, ctx, Mode::Event(event_type))
    }

    fn build(
        &self,
        instance: &ProcessInstance,
        graph: &ProcessGraph,
        ctx: &RuntimeContext,
        mode: Mode<'_>,
    ) -> EligibleSpace {
        let completed = instance.completed_node_ids();
        let fresh = instance.node_executions.is_empty();

        // ── Candidate nodes ──

        let mut candidate_nodes: BTreeSet<NodeId> = BTreeSet::new();
        // Failure-routed targets, with the reason they were routed in.
        let mut routed: BTreeMap<NodeId, String> = BTreeMap::new();

        match &mode {
            Mode::Entry => {
                candidate_nodes.extend(graph.entry_node_ids().iter().cloned());
            }
            Mode::Normal | Mode::Event(_) => {
                if fresh && instance.active_node_ids.is_empty() {
                    candidate_nodes.extend(graph.entry_node_ids().iter().cloned());
                }
                for active in &instance.active_node_ids {
                    for edge in graph.outbound_edges(active) {
                        candidate_nodes.insert(edge.target_node_id.clone());
                    }
                }
                for done in &completed {
                    for edge in graph.outbound_edges(done) {
                        if !instance.has_executed_node(&edge.target_node_id) {
                            candidate_nodes.insert(edge.target_node_id.clone());
                        }
                    }
                }
                if let Mode::Event(event_type) = &mode {
                    for node in graph.nodes_subscribed_to(event_type) {
                        if !instance.has_executed_node(&node.id) {
                            candidate_nodes.insert(node.id.clone());
                        }
                    }
                }
                self.collect_failure_routes(instance, graph, &mut candidate_nodes, &mut routed);
            }
        }

        // ── Candidate edges ──

        let mut candidate_edges: BTreeSet<EdgeId> = BTreeSet::new();
        if !matches!(mode, Mode::Entry) {
            for done in &completed {
                for edge in graph.outbound_edges(done) {
                    candidate_edges.insert(edge.id.clone());
                }
            }
            for pending in &instance.pending_edge_ids {
                if graph.edge(pending).is_some() {
                    candidate_edges.insert(pending.clone());
                }
            }
            if let Mode::Event(event_type) = &mode {
                for edge in graph.edges_activated_by(event_type) {
                    candidate_edges.insert(edge.id.clone());
                }
            }
        }

        // Pull in whole parallel fan-in groups so joins see every sibling,
        // and make sure every edge target gets a node evaluation.
        for edge_id in candidate_edges.clone() {
            if let Some(edge) = graph.edge(&edge_id) {
                if edge.semantics.is_parallel() {
                    for sibling in graph.parallel_inbound_edges(&edge.target_node_id) {
                        candidate_edges.insert(sibling.id.clone());
                    }
                }
                if !instance.has_executed_node(&edge.target_node_id) {
                    candidate_nodes.insert(edge.target_node_id.clone());
                }
            }
        }

        // ── Node evaluations (deduped) ──

        let mut node_evals: BTreeMap<NodeId, NodeEvaluation> = BTreeMap::new();
        for node_id in &candidate_nodes {
            if let Some(node) = graph.node(node_id) {
                node_evals.insert(node_id.clone(), self.nodes.evaluate(node, ctx));
            }
        }

        // ── Source rule/policy maps, keyed by source-node id ──

        let mut source_evals: BTreeMap<NodeId, NodeEvaluation> = BTreeMap::new();
        for edge_id in &candidate_edges {
            let Some(edge) = graph.edge(edge_id) else { continue };
            let source = &edge.source_node_id;
            if source_evals.contains_key(source) {
                continue;
            }
            if let Some(eval) = node_evals.get(source) {
                source_evals.insert(source.clone(), eval.clone());
            } else if let Some(node) = graph.node(source) {
                source_evals.insert(source.clone(), self.nodes.evaluate(node, ctx));
            }
        }

        // ── Edge evaluations ──

        let empty_rules = BTreeMap::new();
        let empty_policies = BTreeMap::new();
        let mut edge_evals: BTreeMap<EdgeId, EdgeEvaluation> = BTreeMap::new();
        for edge_id in &candidate_edges {
            let Some(edge) = graph.edge(edge_id) else { continue };
            let (rules, policies) = source_evals
                .get(&edge.source_node_id)
                .map(|e| (&e.rule_outputs, &e.policy_outcomes))
                .unwrap_or((&empty_rules, &empty_policies));
            edge_evals.insert(
                edge_id.clone(),
                self.edges.evaluate(edge, ctx, rules, policies),
            );
        }

        // ── Candidate actions ──

        let mut actions: Vec<CandidateAction> = Vec::new();
        for edge_id in &candidate_edges {
            let Some(edge) = graph.edge(edge_id) else { continue };
            let Some(edge_eval) = edge_evals.get(edge_id).cloned() else { continue };
            if !edge_eval.traversable {
                continue;
            }
            let target = &edge.target_node_id;
            if instance.has_executed_node(target) || instance.has_running_node(target) {
                continue;
            }
            let Some(node_eval) = node_evals.get(target) else { continue };
            if !node_eval.available {
                continue;
            }

            // Parallel in-edges release their target only when the join over
            // the whole fan-in group is satisfied.
            if let Some(join) = edge.semantics.join_type() {
                let group_edges = graph.parallel_inbound_edges(target);
                let group: Vec<(&Edge, bool)> = group_edges
                    .iter()
                    .map(|sibling| {
                        let ready = completed.contains(&sibling.source_node_id)
                            && edge_evals
                                .get(&sibling.id)
                                .map(|e| e.traversable)
                                .unwrap_or(false);
                        (*sibling, ready)
                    })
                    .collect();
                if let Err(reason) = join_satisfied(join, &group) {
                    edge_evals.insert(
                        edge_id.clone(),
                        EdgeEvaluation::not_traversable(edge_id, reason),
                    );
                    continue;
                }
            }

            actions.push(CandidateAction {
                node_id: target.clone(),
                edge_id: Some(edge_id.clone()),
                node_evaluation: node_eval.clone(),
                edge_evaluation: Some(edge_eval),
                effective_priority: edge.priority.weight,
                rank: edge.priority.rank,
                exclusive: edge.priority.exclusive,
                parallel: edge.semantics.is_parallel(),
            });
        }

        // Entry actions carry no edge and a fixed default priority.
        let entry_eligible = matches!(mode, Mode::Entry) || (fresh && instance.active_node_ids.is_empty());
        if entry_eligible {
            for entry in graph.entry_node_ids() {
                if instance.has_executed_node(entry) || instance.has_running_node(entry) {
                    continue;
                }
                if let Some(node_eval) = node_evals.get(entry) {
                    if node_eval.available {
                        actions.push(CandidateAction {
                            node_id: entry.clone(),
                            edge_id: None,
                            node_evaluation: node_eval.clone(),
                            edge_evaluation: None,
                            effective_priority: ENTRY_ACTION_PRIORITY,
                            rank: 0,
                            exclusive: false,
                            parallel: false,
                        });
                    }
                }
            }
        }

        // Failure-routed targets enter edge-less, like entries.
        for (target, _reason) in &routed {
            if instance.has_executed_node(target) || instance.has_running_node(target) {
                continue;
            }
            if let Some(node_eval) = node_evals.get(target) {
                if node_eval.available {
                    actions.push(CandidateAction {
                        node_id: target.clone(),
                        edge_id: None,
                        node_evaluation: node_eval.clone(),
                        edge_evaluation: None,
                        effective_priority: ENTRY_ACTION_PRIORITY,
                        rank: 0,
                        exclusive: false,
                        parallel: false,
                    });
                }
            }
        }

        // Stable total order, then one action per target node.
        actions.sort_by(|a, b| {
            b.effective_priority
                .cmp(&a.effective_priority)
                .then(a.rank.cmp(&b.rank))
                .then(a.edge_id.cmp(&b.edge_id))
        });
        let mut seen: HashSet<NodeId> = HashSet::new();
        actions.retain(|a| seen.insert(a.node_id.clone()));

        EligibleSpace {
            eligible_nodes: node_evals.into_values().collect(),
            traversable_edges: edge_evals.into_values().collect(),
            candidate_actions: actions,
            evaluated_at: Utc::now(),
        }
    }

    /// Failure routing: a failed node whose dispatching in-edge carried
    /// `ESCALATE` routes through its exception routes; `COMPENSATE` routes
    /// to the compensation target.
    fn collect_failure_routes(
        &self,
        instance: &ProcessInstance,
        graph: &ProcessGraph,
        candidate_nodes: &mut BTreeSet<NodeId>,
        routed: &mut BTreeMap<NodeId, String>,
    ) {
        for node in graph.nodes() {
            let Some(latest) = instance.latest_execution(&node.id) else { continue };
            if latest.status != ExecutionStatus::Failed {
                continue;
            }
            let compensation = latest
                .via_edge_id
                .as_deref()
                .and_then(|id| graph.edge(id))
                .map(|e| e.compensation.clone())
                .unwrap_or(Compensation::None);
            match compensation {
                Compensation::Escalate => {
                    for route in &node.exception_routes {
                        if !instance.has_executed_node(&route.target_node_id) {
                            candidate_nodes.insert(route.target_node_id.clone());
                            routed.entry(route.target_node_id.clone()).or_insert_with(|| {
                                format!("escalation route from failed node {}", node.id)
                            });
                        }
                    }
                }
                Compensation::Compensate { target_node_id } => {
                    if !instance.has_executed_node(&target_node_id) {
                        candidate_nodes.insert(target_node_id.clone());
                        routed.entry(target_node_id).or_insert_with(|| {
                            format!("compensation route from failed node {}", node.id)
                        });
                    }
                }
                Compensation::None | Compensation::Retry { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::expression::SimpleExpressionEvaluator;
    use crate::graph::GraphDefinition;
    use crate::types::{
        ActionSpec, ActionType, Edge, EdgeGuards, EdgePriority, ExecutionSemantics, JoinType, Node,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            preconditions: vec![],
            rules: vec![],
            policy_gates: vec![],
            action: ActionSpec {
                action_type: ActionType::SystemInvocation,
                handler_ref: "noop".to_string(),
                config: Default::default(),
            },
            events: Default::default(),
            exception_routes: vec![],
            required_permissions: vec![],
            input_compartments: vec![],
            metadata: Default::default(),
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> Edge {
        Edge {
            id: id.to_string(),
            source_node_id: source.to_string(),
            target_node_id: target.to_string(),
            guards: Default::default(),
            semantics: Default::default(),
            priority: EdgePriority {
                weight: 10,
                ..Default::default()
            },
            activating_events: vec![],
            compensation: Default::default(),
        }
    }

    fn parallel_edge(id: &str, source: &str, target: &str, join: JoinType) -> Edge {
        let mut e = edge(id, source, target);
        e.semantics = ExecutionSemantics::Parallel { join };
        e
    }

    fn graph(def: GraphDefinition) -> ProcessGraph {
        ProcessGraph::from_definition(def)
    }

    fn linear() -> ProcessGraph {
        graph(GraphDefinition {
            id: "linear".to_string(),
            version: 1,
            metadata: Default::default(),
            entry_node_ids: vec!["A".to_string()],
            terminal_node_ids: vec!["C".to_string()],
            nodes: vec![node("A"), node("B"), node("C")],
            edges: vec![edge("e1", "A", "B"), edge("e2", "B", "C")],
        })
    }

    fn evaluator() -> EligibilityEvaluator {
        EligibilityEvaluator::new(Arc::new(SimpleExpressionEvaluator::new()))
    }

    fn ctx(instance: &ProcessInstance) -> RuntimeContext {
        RuntimeContext::assemble(&instance.context, Default::default(), None)
    }

    fn complete(instance: &mut ProcessInstance, node_id: &str) {
        instance
            .start_node_execution(node_id, Uuid::now_v7(), None)
            .unwrap();
        instance.complete_node_execution(node_id, None).unwrap();
    }

    #[test]
    fn fresh_instance_offers_entry_actions() {
        let g = linear();
        let inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert_eq!(space.candidate_actions.len(), 1);
        let action = &space.candidate_actions[0];
        assert_eq!(action.node_id, "A");
        assert_eq!(action.edge_id, None);
        assert_eq!(action.effective_priority, ENTRY_ACTION_PRIORITY);
    }

    #[test]
    fn completion_offers_successor_via_edge() {
        let g = linear();
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        complete(&mut inst, "A");
        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert_eq!(space.candidate_actions.len(), 1);
        let action = &space.candidate_actions[0];
        assert_eq!(action.node_id, "B");
        assert_eq!(action.edge_id.as_deref(), Some("e1"));
    }

    #[test]
    fn executed_targets_are_not_offered_again() {
        let g = linear();
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        complete(&mut inst, "A");
        complete(&mut inst, "B");
        complete(&mut inst, "C");
        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert!(space.is_empty());
    }

    #[test]
    fn untraversable_guard_keeps_rejection_for_trace() {
        let mut def = linear().definition().clone();
        def.edges[0].guards = EdgeGuards {
            context: vec!["flag = true".to_string()],
            ..Default::default()
        };
        let g = graph(def);
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        inst.context.domain.insert("flag".to_string(), json!(false));
        complete(&mut inst, "A");

        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert!(space.is_empty());
        let rejected = space
            .traversable_edges
            .iter()
            .find(|e| e.edge_id == "e1")
            .unwrap();
        assert!(!rejected.traversable);
        assert!(rejected.reason.as_deref().unwrap().contains("context guard"));
    }

    #[test]
    fn parallel_fan_out_offers_every_branch() {
        let g = graph(GraphDefinition {
            id: "fanout".to_string(),
            version: 1,
            metadata: Default::default(),
            entry_node_ids: vec!["AI".to_string()],
            terminal_node_ids: vec!["X".to_string(), "Y".to_string(), "Z".to_string()],
            nodes: vec![node("AI"), node("X"), node("Y"), node("Z")],
            edges: vec![
                parallel_edge("px", "AI", "X", JoinType::All),
                parallel_edge("py", "AI", "Y", JoinType::All),
                parallel_edge("pz", "AI", "Z", JoinType::All),
            ],
        });
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        complete(&mut inst, "AI");

        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        let targets: Vec<&str> = space
            .candidate_actions
            .iter()
            .map(|a| a.node_id.as_str())
            .collect();
        assert_eq!(targets, vec!["X", "Y", "Z"]);
        assert!(space.candidate_actions.iter().all(|a| a.parallel));
    }

    fn join_all_graph() -> ProcessGraph {
        graph(GraphDefinition {
            id: "join".to_string(),
            version: 1,
            metadata: Default::default(),
            entry_node_ids: vec!["P".to_string(), "Q".to_string(), "R".to_string()],
            terminal_node_ids: vec!["J".to_string()],
            nodes: vec![node("P"), node("Q"), node("R"), node("J")],
            edges: vec![
                parallel_edge("jp", "P", "J", JoinType::All),
                parallel_edge("jq", "Q", "J", JoinType::All),
                parallel_edge("jr", "R", "J", JoinType::All),
            ],
        })
    }

    #[test]
    fn join_all_holds_until_every_source_completes() {
        let g = join_all_graph();
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        complete(&mut inst, "P");
        complete(&mut inst, "Q");

        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert!(space.is_empty(), "join must hold with 2 of 3 sources done");
        assert!(space
            .traversable_edges
            .iter()
            .any(|e| e.reason.as_deref().map(|r| r.contains("join ALL")).unwrap_or(false)));

        complete(&mut inst, "R");
        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert_eq!(space.candidate_actions.len(), 1);
        assert_eq!(space.candidate_actions[0].node_id, "J");
    }

    #[test]
    fn join_any_releases_on_first_branch() {
        let mut def = join_all_graph().definition().clone();
        for e in &mut def.edges {
            e.semantics = ExecutionSemantics::Parallel {
                join: JoinType::Any,
            };
        }
        let g = graph(def);
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        complete(&mut inst, "P");

        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert_eq!(space.candidate_actions.len(), 1);
        assert_eq!(space.candidate_actions[0].node_id, "J");
    }

    #[test]
    fn multiple_in_edges_dedupe_to_highest_priority() {
        let mut def = linear().definition().clone();
        def.edges = vec![
            edge("low", "A", "B"),
            {
                let mut e = edge("high", "A", "B");
                e.priority.weight = 90;
                e
            },
        ];
        def.terminal_node_ids = vec!["B".to_string()];
        let g = graph(def);
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        complete(&mut inst, "A");

        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert_eq!(space.candidate_actions.len(), 1);
        assert_eq!(space.candidate_actions[0].edge_id.as_deref(), Some("high"));
        assert_eq!(space.candidate_actions[0].effective_priority, 90);
    }

    #[test]
    fn event_mode_activates_event_edges() {
        let mut def = linear().definition().clone();
        def.edges[0].guards = EdgeGuards {
            events: vec!["ApprovalGranted".to_string()],
            ..Default::default()
        };
        def.edges[0].activating_events = vec!["ApprovalGranted".to_string()];
        let g = graph(def);
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        complete(&mut inst, "A");

        // Steady state: the event guard fails.
        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        assert!(space.is_empty());

        // After the event: the edge activates and the guard sees the event.
        let record = crate::context::EventRecord {
            event_id: Uuid::now_v7(),
            event_type: "ApprovalGranted".to_string(),
            received_at: chrono::Utc::now(),
            payload: serde_json::Value::Null,
        };
        let rt = RuntimeContext::assemble(&inst.context, Default::default(), Some(record));
        let space = evaluator().reevaluate_after_event(&inst, &g, &rt, "ApprovalGranted");
        assert_eq!(space.candidate_actions.len(), 1);
        assert_eq!(space.candidate_actions[0].node_id, "B");
    }

    #[test]
    fn escalation_routes_failed_node_to_exception_target() {
        let mut def = linear().definition().clone();
        def.nodes[1].exception_routes = vec![crate::types::ExceptionRoute {
            error_kind: None,
            target_node_id: "C".to_string(),
        }];
        def.edges[0].compensation = Compensation::Escalate;
        let g = graph(def);
        let mut inst = ProcessInstance::new(&g, None, ExecutionContext::default());
        complete(&mut inst, "A");
        inst.start_node_execution("B", Uuid::now_v7(), Some("e1".to_string()))
            .unwrap();
        inst.mark_node_failed("B", "handler exploded").unwrap();

        let space = evaluator().evaluate(&inst, &g, &ctx(&inst));
        let routed = space
            .candidate_actions
            .iter()
            .find(|a| a.node_id == "C")
            .expect("escalation target must be offered");
        assert_eq!(routed.edge_id, None);
    }
}
