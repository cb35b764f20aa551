//! Deterministic navigation: selects which candidate actions to dispatch.
//!
//! Selection is pure — the same eligible space, instance, graph, and
//! constraints always produce the same decision. The ladder runs exclusive
//! preemption first, then the dependency filter, then the single-option
//! shortcut, then parallel grouping, then highest priority.

use crate::eval::eligibility::{CandidateAction, EligibleSpace};
use crate::graph::ProcessGraph;
use crate::instance::ProcessInstance;
use crate::types::{EdgeId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ─── Decision types ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    Proceed,
    Wait,
    Complete,
    Blocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionCriteria {
    Exclusive,
    DependencyOrder,
    HighestPriority,
    Parallel,
    SingleOption,
    NoOptions,
}

/// One candidate with the verdict it received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub node_id: NodeId,
    pub edge_id: Option<EdgeId>,
    pub effective_priority: i32,
    pub selected: bool,
    pub reason: String,
}

/// The outcome of one selection pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationDecision {
    pub decision: DecisionType,
    pub selected_nodes: Vec<NodeId>,
    /// Every candidate, selected or rejected, with its reason.
    pub alternatives: Vec<Alternative>,
    pub selection_criteria: SelectionCriteria,
    pub selection_reason: String,
    /// True when the dependency filter emptied the set and the unfiltered
    /// candidates were restored (starvation prevention, surfaced for
    /// deadlock visibility).
    pub constraints_relaxed: bool,
    pub eligible_space: EligibleSpace,
    pub decided_at: DateTime<Utc>,
}

impl NavigationDecision {
    /// The selected action for `node_id`, when it was selected.
    pub fn selected_action<'a>(&'a self, node_id: &str) -> Option<&'a CandidateAction> {
        self.eligible_space
            .candidate_actions
            .iter()
            .find(|a| a.node_id == node_id)
            .filter(|_| self.selected_nodes.iter().any(|n| n == node_id))
    }
}

/// Declarative ordering constraints fed to the decider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyConstraints {
    /// Node → set of nodes that must be `COMPLETED` before it runs.
    #[serde(default)]
    pub must_execute_before: BTreeMap<NodeId, BTreeSet<NodeId>>,
    /// Unordered pairs that must not run in the same parallel step.
    #[serde(default)]
    pub must_not_parallel: BTreeSet<(NodeId, NodeId)>,
}

impl DependencyConstraints {
    pub fn allows_parallel(&self, a: &str, b: &str) -> bool {
        !self
            .must_not_parallel
            .contains(&(a.to_string(), b.to_string()))
            && !self
                .must_not_parallel
                .contains(&(b.to_string(), a.to_string()))
    }
}

// ─── Decider ──────────────────────────────────────────────────

/// Pure, order-stable selection over the eligible space.
pub struct NavigationDecider {
    max_parallel_per_step: Option<usize>,
}

impl NavigationDecider {
    pub fn new(max_parallel_per_step: Option<usize>) -> Self {
        Self {
            max_parallel_per_step,
        }
    }

    pub fn select(
        &self,
        space: EligibleSpace,
        instance: &ProcessInstance,
        graph: &ProcessGraph,
        constraints: &DependencyConstraints,
    ) -> NavigationDecision {
        let decided_at = Utc::now();
        let completed = instance.completed_node_ids();

        // 1. Empty space: complete when a terminal node has been reached,
        //    otherwise wait.
        if space.candidate_actions.is_empty() {
            let terminal_reached = graph
                .terminal_node_ids()
                .iter()
                .any(|t| completed.contains(t));
            let (decision, reason) = if terminal_reached {
                (DecisionType::Complete, "all terminal nodes reached")
            } else {
                (DecisionType::Wait, "no eligible actions")
            };
            return NavigationDecision {
                decision,
                selected_nodes: vec![],
                alternatives: vec![],
                selection_criteria: SelectionCriteria::NoOptions,
                selection_reason: reason.to_string(),
                constraints_relaxed: false,
                eligible_space: space,
                decided_at,
            };
        }

        // 2. Stable total order: priority desc, rank asc, edge id asc.
        let mut sorted: Vec<&CandidateAction> = space.candidate_actions.iter().collect();
        sorted.sort_by(|a, b| {
            b.effective_priority
                .cmp(&a.effective_priority)
                .then(a.rank.cmp(&b.rank))
                .then(a.edge_id.cmp(&b.edge_id))
        });

        // 3. Exclusive preemption.
        if let Some(winner) = sorted.iter().find(|a| a.exclusive) {
            let selected_nodes = vec![winner.node_id.clone()];
            let alternatives = sorted
                .iter()
                .map(|a| Alternative {
                    node_id: a.node_id.clone(),
                    edge_id: a.edge_id.clone(),
                    effective_priority: a.effective_priority,
                    selected: a.node_id == winner.node_id,
                    reason: if a.node_id == winner.node_id {
                        "exclusive edge preempts all alternatives".to_string()
                    } else {
                        "preempted by exclusive edge".to_string()
                    },
                })
                .collect();
            return NavigationDecision {
                decision: DecisionType::Proceed,
                selected_nodes,
                alternatives,
                selection_criteria: SelectionCriteria::Exclusive,
                selection_reason: format!(
                    "exclusive edge {} preempts {} alternative(s)",
                    winner.edge_id.as_deref().unwrap_or("<entry>"),
                    sorted.len() - 1
                ),
                constraints_relaxed: false,
                eligible_space: space,
                decided_at,
            };
        }

        // 4. Dependency filter: explicit must-execute-before sets and the
        //    implicit source-completed dependency. An emptied set is
        //    restored to prevent starvation.
        let satisfies_deps = |a: &CandidateAction| -> bool {
            if let Some(before) = constraints.must_execute_before.get(&a.node_id) {
                if !before.iter().all(|dep| completed.contains(dep)) {
                    return false;
                }
            }
            if let Some(edge_id) = &a.edge_id {
                if let Some(edge) = graph.edge(edge_id) {
                    if !completed.contains(&edge.source_node_id) {
                        return false;
                    }
                }
            }
            true
        };
        let filtered: Vec<&CandidateAction> =
            sorted.iter().copied().filter(|a| satisfies_deps(a)).collect();
        let constraints_relaxed = filtered.is_empty();
        let pool = if constraints_relaxed { sorted.clone() } else { filtered };
        let dropped_by_deps: BTreeSet<&str> = if constraints_relaxed {
            BTreeSet::new()
        } else {
            sorted
                .iter()
                .filter(|a| !satisfies_deps(a))
                .map(|a| a.node_id.as_str())
                .collect()
        };

        // 5. Single option left.
        if pool.len() == 1 {
            let winner = pool[0];
            return self.decide(
                space.clone(),
                sorted,
                vec![winner.node_id.clone()],
                SelectionCriteria::SingleOption,
                "single eligible action".to_string(),
                constraints_relaxed,
                &dropped_by_deps,
                decided_at,
            );
        }

        // 6. Parallel grouping: take the parallel subset, minus pairs the
        //    constraints keep apart, up to the configured cap.
        let mut parallel_group: Vec<&CandidateAction> = Vec::new();
        for action in pool.iter().copied().filter(|a| a.parallel) {
            let compatible = parallel_group
                .iter()
                .all(|kept| constraints.allows_parallel(&kept.node_id, &action.node_id));
            if !compatible {
                continue;
            }
            if let Some(cap) = self.max_parallel_per_step {
                if parallel_group.len() >= cap {
                    break;
                }
            }
            parallel_group.push(action);
        }
        if parallel_group.len() >= 2 {
            let selected: Vec<NodeId> =
                parallel_group.iter().map(|a| a.node_id.clone()).collect();
            let count = selected.len();
            return self.decide(
                space.clone(),
                sorted,
                selected,
                SelectionCriteria::Parallel,
                format!("{count} parallel actions dispatched together"),
                constraints_relaxed,
                &dropped_by_deps,
                decided_at,
            );
        }

        // 7. Highest priority wins.
        let winner = pool[0];
        self.decide(
            space.clone(),
            sorted,
            vec![winner.node_id.clone()],
            SelectionCriteria::HighestPriority,
            format!(
                "highest effective priority {} among {} candidates",
                winner.effective_priority,
                space.candidate_actions.len()
            ),
            constraints_relaxed,
            &dropped_by_deps,
            decided_at,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        space: EligibleSpace,
        sorted: Vec<&CandidateAction>,
        selected_nodes: Vec<NodeId>,
        selection_criteria: SelectionCriteria,
        mut selection_reason: String,
        constraints_relaxed: bool,
        dropped_by_deps: &BTreeSet<&str>,
        decided_at: DateTime<Utc>,
    ) -> NavigationDecision {
        if constraints_relaxed {
            selection_reason.push_str(
                " (dependency filter emptied the candidate set; unfiltered set restored)",
            );
        }
        let alternatives = sorted
            .iter()
            .map(|a| {
                let selected = selected_nodes.iter().any(|n| n == &a.node_id);
                let reason = if selected {
                    match selection_criteria {
                        SelectionCriteria::Parallel => "selected for parallel dispatch".to_string(),
                        SelectionCriteria::SingleOption => "only eligible action".to_string(),
                        _ => "highest priority candidate".to_string(),
                    }
                } else if dropped_by_deps.contains(a.node_id.as_str()) {
                    "dependency constraints not yet satisfied".to_string()
                } else {
                    "lower priority than the selected action(s)".to_string()
                };
                Alternative {
                    node_id: a.node_id.clone(),
                    edge_id: a.edge_id.clone(),
                    effective_priority: a.effective_priority,
                    selected,
                    reason,
                }
            })
            .collect();
        NavigationDecision {
            decision: DecisionType::Proceed,
            selected_nodes,
            alternatives,
            selection_criteria,
            selection_reason,
            constraints_relaxed,
            eligible_space: space,
            decided_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::eval::eligibility::CandidateAction;
    use crate::eval::node::NodeEvaluation;
    use crate::graph::{GraphDefinition, ProcessGraph};
    use crate::types::{ActionSpec, ActionType, Edge, EdgePriority, Node};
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

    fn edge(id: &str, source: &str, target: &str, weight: i32) -> Edge {
        Edge {
            id: id.to_string(),
            source_node_id: source.to_string(),
            target_node_id: target.to_string(),
            guards: Default::default(),
            semantics: Default::default(),
            priority: EdgePriority {
                weight,
                ..Default::default()
            },
            activating_events: vec![],
            compensation: Default::default(),
        }
    }

    fn review_graph() -> ProcessGraph {
        ProcessGraph::from_definition(GraphDefinition {
            id: "review".to_string(),
            version: 1,
            metadata: Default::default(),
            entry_node_ids: vec!["REVIEW".to_string()],
            terminal_node_ids: vec!["CANCELLED".to_string(), "ACCOUNTS".to_string()],
            nodes: vec![node("REVIEW"), node("ACCOUNTS"), node("CANCELLED")],
            edges: vec![
                edge("to_accounts", "REVIEW", "ACCOUNTS", 50),
                {
                    let mut e = edge("to_cancelled", "REVIEW", "CANCELLED", 1000);
                    e.priority.exclusive = true;
                    e
                },
            ],
        })
    }

    fn action(
        node_id: &str,
        edge_id: Option<&str>,
        priority: i32,
        exclusive: bool,
        parallel: bool,
    ) -> CandidateAction {
        CandidateAction {
            node_id: node_id.to_string(),
            edge_id: edge_id.map(str::to_string),
            node_evaluation: NodeEvaluation::available(node_id, Default::default(), Default::default()),
            edge_evaluation: None,
            effective_priority: priority,
            rank: 0,
            exclusive,
            parallel,
        }
    }

    fn space(actions: Vec<CandidateAction>) -> EligibleSpace {
        EligibleSpace {
            eligible_nodes: actions.iter().map(|a| a.node_evaluation.clone()).collect(),
            traversable_edges: vec![],
            candidate_actions: actions,
            evaluated_at: Utc::now(),
        }
    }

    fn instance(graph: &ProcessGraph) -> ProcessInstance {
        ProcessInstance::new(graph, None, ExecutionContext::default())
    }

    fn complete(inst: &mut ProcessInstance, node_id: &str) {
        inst.start_node_execution(node_id, Uuid::now_v7(), None).unwrap();
        inst.complete_node_execution(node_id, None).unwrap();
    }

    fn decider() -> NavigationDecider {
        NavigationDecider::new(None)
    }

    #[test]
    fn empty_space_waits_until_terminal_reached() {
        let g = review_graph();
        let mut inst = instance(&g);
        let d = decider().select(space(vec![]), &inst, &g, &Default::default());
        assert_eq!(d.decision, DecisionType::Wait);
        assert_eq!(d.selection_criteria, SelectionCriteria::NoOptions);

        complete(&mut inst, "CANCELLED");
        let d = decider().select(space(vec![]), &inst, &g, &Default::default());
        assert_eq!(d.decision, DecisionType::Complete);
        assert_eq!(d.selection_reason, "all terminal nodes reached");
    }

    #[test]
    fn exclusive_edge_preempts_higher_sorted_alternatives() {
        let g = review_graph();
        let mut inst = instance(&g);
        complete(&mut inst, "REVIEW");

        let actions = vec![
            action("ACCOUNTS", Some("to_accounts"), 50, false, false),
            action("CANCELLED", Some("to_cancelled"), 1000, true, false),
        ];
        let d = decider().select(space(actions), &inst, &g, &Default::default());
        assert_eq!(d.decision, DecisionType::Proceed);
        assert_eq!(d.selection_criteria, SelectionCriteria::Exclusive);
        assert_eq!(d.selected_nodes, vec!["CANCELLED".to_string()]);

        let rejected = d
            .alternatives
            .iter()
            .find(|a| a.node_id == "ACCOUNTS")
            .unwrap();
        assert!(!rejected.selected);
        assert_eq!(rejected.reason, "preempted by exclusive edge");
    }

    #[test]
    fn selection_is_pure_and_order_stable() {
        let g = review_graph();
        let mut inst = instance(&g);
        complete(&mut inst, "REVIEW");
        let actions = vec![
            action("ACCOUNTS", Some("to_accounts"), 50, false, false),
            action("CANCELLED", Some("to_cancelled"), 50, false, false),
        ];

        let first = decider().select(space(actions.clone()), &inst, &g, &Default::default());
        for _ in 0..5 {
            let again = decider().select(space(actions.clone()), &inst, &g, &Default::default());
            assert_eq!(again.selected_nodes, first.selected_nodes);
            assert_eq!(again.selection_criteria, first.selection_criteria);
        }
        // Equal priority resolves by edge id: "to_accounts" < "to_cancelled".
        assert_eq!(first.selected_nodes, vec!["ACCOUNTS".to_string()]);
    }

    #[test]
    fn dependency_filter_drops_then_restores_when_emptied() {
        let g = review_graph();
        let mut inst = instance(&g);
        complete(&mut inst, "REVIEW");

        let mut constraints = DependencyConstraints::default();
        constraints.must_execute_before.insert(
            "ACCOUNTS".to_string(),
            BTreeSet::from(["CANCELLED".to_string()]),
        );
        let actions = vec![
            action("ACCOUNTS", Some("to_accounts"), 50, false, false),
            action("CANCELLED", Some("to_cancelled"), 10, false, false),
        ];
        let d = decider().select(space(actions.clone()), &inst, &g, &constraints);
        assert_eq!(d.selected_nodes, vec!["CANCELLED".to_string()]);
        assert!(!d.constraints_relaxed);

        // Now every candidate is blocked by constraints: restore unfiltered.
        constraints.must_execute_before.insert(
            "CANCELLED".to_string(),
            BTreeSet::from(["ACCOUNTS".to_string()]),
        );
        let d = decider().select(space(actions), &inst, &g, &constraints);
        assert!(d.constraints_relaxed);
        assert!(d.selection_reason.contains("restored"));
        assert!(!d.selected_nodes.is_empty());
    }

    #[test]
    fn implicit_source_dependency_defers_unready_edges() {
        let g = review_graph();
        let inst = instance(&g); // REVIEW not completed
        let actions = vec![
            action("ACCOUNTS", Some("to_accounts"), 50, false, false),
            action("REVIEW", None, 100, false, false),
        ];
        let d = decider().select(space(actions), &inst, &g, &Default::default());
        // ACCOUNTS' source (REVIEW) is not completed, so REVIEW is selected.
        assert_eq!(d.selected_nodes, vec!["REVIEW".to_string()]);
    }

    #[test]
    fn parallel_subset_selected_together() {
        let g = review_graph();
        let mut inst = instance(&g);
        complete(&mut inst, "REVIEW");
        let actions = vec![
            action("ACCOUNTS", Some("to_accounts"), 50, false, true),
            action("CANCELLED", Some("to_cancelled"), 50, false, true),
        ];
        let d = decider().select(space(actions), &inst, &g, &Default::default());
        assert_eq!(d.selection_criteria, SelectionCriteria::Parallel);
        assert_eq!(d.selected_nodes.len(), 2);
    }

    #[test]
    fn must_not_parallel_splits_the_group() {
        let g = review_graph();
        let mut inst = instance(&g);
        complete(&mut inst, "REVIEW");
        let mut constraints = DependencyConstraints::default();
        constraints
            .must_not_parallel
            .insert(("ACCOUNTS".to_string(), "CANCELLED".to_string()));
        let actions = vec![
            action("ACCOUNTS", Some("to_accounts"), 50, false, true),
            action("CANCELLED", Some("to_cancelled"), 50, false, true),
        ];
        let d = decider().select(space(actions), &inst, &g, &constraints);
        // Group collapses to one action; highest-priority path wins instead.
        assert_eq!(d.selected_nodes.len(), 1);
        assert_ne!(d.selection_criteria, SelectionCriteria::Parallel);
    }

    #[test]
    fn max_parallel_per_step_caps_the_group() {
        let g = review_graph();
        let mut inst = instance(&g);
        complete(&mut inst, "REVIEW");
        let actions = vec![
            action("ACCOUNTS", Some("to_accounts"), 50, false, true),
            action("CANCELLED", Some("to_cancelled"), 50, false, true),
        ];
        let d = NavigationDecider::new(Some(2)).select(
            space(actions.clone()),
            &inst,
            &g,
            &Default::default(),
        );
        assert_eq!(d.selected_nodes.len(), 2);

        // A cap below two suppresses parallel grouping entirely.
        let d = NavigationDecider::new(Some(1)).select(space(actions), &inst, &g, &Default::default());
        assert_eq!(d.selected_nodes.len(), 1);
    }

    #[test]
    fn single_option_short_circuit() {
        let g = review_graph();
        let mut inst = instance(&g);
        complete(&mut inst, "REVIEW");
        let actions = vec![action("ACCOUNTS", Some("to_accounts"), 50, false, false)];
        let d = decider().select(space(actions), &inst, &g, &Default::default());
        assert_eq!(d.selection_criteria, SelectionCriteria::SingleOption);
        assert_eq!(d.selected_nodes, vec!["ACCOUNTS".to_string()]);
    }

    #[test]
    fn every_candidate_appears_in_alternatives() {
        let g = review_graph();
        let mut inst = instance(&g);
        complete(&mut inst, "REVIEW");
        let actions = vec![
            action("ACCOUNTS", Some("to_accounts"), 50, false, false),
            action("CANCELLED", Some("to_cancelled"), 10, false, false),
        ];
        let d = decider().select(space(actions), &inst, &g, &Default::default());
        assert_eq!(d.alternatives.len(), 2);
        assert_eq!(
            d.alternatives.iter().filter(|a| a.selected).count(),
            d.selected_nodes.len()
        );
    }
}
