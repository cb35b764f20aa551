//! Edge evaluation: the four guard compartments, plus parallel-join
//! satisfaction for fan-in targets.

use crate::context::RuntimeContext;
use crate::expression::{truthy, ExpressionEvaluator};
use crate::types::{Edge, EdgeId, JoinType, PolicyOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of evaluating one edge. Never an error: expression failures are
/// fatal for the edge, not the cycle, and land in `reason`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeEvaluation {
    pub edge_id: EdgeId,
    pub traversable: bool,
    pub reason: Option<String>,
}

impl EdgeEvaluation {
    pub fn traversable(edge_id: &str) -> Self {
        Self {
            edge_id: edge_id.to_string(),
            traversable: true,
            reason: None,
        }
    }

    pub fn not_traversable(edge_id: &str, reason: impl Into<String>) -> Self {
        Self {
            edge_id: edge_id.to_string(),
            traversable: false,
            reason: Some(reason.into()),
        }
    }
}

/// Evaluates the four guard compartments of an edge against the runtime
/// context and the source node's rule/policy outputs.
pub struct EdgeEvaluator {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl EdgeEvaluator {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    pub fn evaluate(
        &self,
        edge: &Edge,
        ctx: &RuntimeContext,
        rule_outputs: &BTreeMap<String, Value>,
        policy_outcomes: &BTreeMap<String, PolicyOutcome>,
    ) -> EdgeEvaluation {
        let bindings = ctx.bindings();

        for expr in &edge.guards.context {
            match self.evaluator.evaluate(expr, &bindings) {
                Ok(ev) if ev.is_truthy() => {}
                Ok(_) => {
                    return EdgeEvaluation::not_traversable(
                        &edge.id,
                        format!("context guard `{expr}` evaluated false"),
                    );
                }
                Err(e) => {
                    return EdgeEvaluation::not_traversable(
                        &edge.id,
                        format!("context guard `{expr}` failed: {e}"),
                    );
                }
            }
        }

        for rule_id in &edge.guards.rules {
            match rule_outputs.get(rule_id) {
                Some(value) if truthy(value) => {}
                Some(_) => {
                    return EdgeEvaluation::not_traversable(
                        &edge.id,
                        format!("rule `{rule_id}` outcome is falsy"),
                    );
                }
                None => {
                    return EdgeEvaluation::not_traversable(
                        &edge.id,
                        format!("rule `{rule_id}` has no recorded output on the source node"),
                    );
                }
            }
        }

        for policy_id in &edge.guards.policies {
            match policy_outcomes.get(policy_id) {
                Some(outcome) if outcome.is_satisfied() => {}
                Some(outcome) => {
                    return EdgeEvaluation::not_traversable(
                        &edge.id,
                        format!("policy `{policy_id}` outcome is {outcome:?}"),
                    );
                }
                None => {
                    return EdgeEvaluation::not_traversable(
                        &edge.id,
                        format!("policy `{policy_id}` has no recorded outcome on the source node"),
                    );
                }
            }
        }

        for event_type in &edge.guards.events {
            if !ctx.has_event(event_type) {
                return EdgeEvaluation::not_traversable(
                    &edge.id,
                    format!("required event `{event_type}` not observed"),
                );
            }
        }

        EdgeEvaluation::traversable(&edge.id)
    }
}

/// Join satisfaction over a parallel fan-in group.
///
/// `group` pairs each inbound parallel edge of the target with whether that
/// branch is ready (source node completed and the edge traversable).
/// Returns `Err(reason)` when the join holds the target back.
pub fn join_satisfied(join: JoinType, group: &[(&Edge, bool)]) -> Result<(), String> {
    let ready = group.iter().filter(|(_, ok)| *ok).count();
    let total = group.len();
    match join {
        JoinType::All => {
            if ready == total {
                Ok(())
            } else {
                Err(format!("join ALL: {ready} of {total} inbound branches ready"))
            }
        }
        JoinType::Any => {
            if ready >= 1 {
                Ok(())
            } else {
                Err(format!("join ANY: 0 of {total} inbound branches ready"))
            }
        }
        JoinType::NOfM { n } => {
            if ready as u32 >= n {
                Ok(())
            } else {
                Err(format!("join {n}_OF_{total}: only {ready} branches ready"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EventRecord, ExecutionContext, RuntimeContext};
    use crate::expression::SimpleExpressionEvaluator;
    use crate::types::{EdgeGuards, ExecutionSemantics};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn edge_with_guards(guards: EdgeGuards) -> Edge {
        Edge {
            id: "e1".to_string(),
            source_node_id: "A".to_string(),
            target_node_id: "B".to_string(),
            guards,
            semantics: ExecutionSemantics::Sequential,
            priority: Default::default(),
            activating_events: vec![],
            compensation: Default::default(),
        }
    }

    fn ctx_with_event(event_type: Option<&str>) -> RuntimeContext {
        let mut ec = ExecutionContext::default();
        ec.domain
            .insert("aiAnalysis".to_string(), json!({"passed": true}));
        let current = event_type.map(|t| EventRecord {
            event_id: Uuid::now_v7(),
            event_type: t.to_string(),
            received_at: Utc::now(),
            payload: serde_json::Value::Null,
        });
        RuntimeContext::assemble(&ec, Default::default(), current)
    }

    fn evaluator() -> EdgeEvaluator {
        EdgeEvaluator::new(Arc::new(SimpleExpressionEvaluator::new()))
    }

    #[test]
    fn context_guard_pass_and_fail() {
        let edge = edge_with_guards(EdgeGuards {
            context: vec!["aiAnalysis.passed = true".to_string()],
            ..Default::default()
        });
        let eval = evaluator().evaluate(&edge, &ctx_with_event(None), &BTreeMap::new(), &BTreeMap::new());
        assert!(eval.traversable);

        let edge = edge_with_guards(EdgeGuards {
            context: vec!["aiAnalysis.passed = false".to_string()],
            ..Default::default()
        });
        let eval = evaluator().evaluate(&edge, &ctx_with_event(None), &BTreeMap::new(), &BTreeMap::new());
        assert!(!eval.traversable);
        assert!(eval.reason.as_deref().unwrap().contains("context guard"));
    }

    #[test]
    fn expression_error_is_fatal_for_the_edge_only() {
        let edge = edge_with_guards(EdgeGuards {
            context: vec!["ghost.binding = 1".to_string()],
            ..Default::default()
        });
        let eval = evaluator().evaluate(&edge, &ctx_with_event(None), &BTreeMap::new(), &BTreeMap::new());
        assert!(!eval.traversable);
        assert!(eval.reason.as_deref().unwrap().contains("failed"));
    }

    #[test]
    fn rule_guard_needs_truthy_recorded_output() {
        let edge = edge_with_guards(EdgeGuards {
            rules: vec!["background_clear".to_string()],
            ..Default::default()
        });

        let mut outputs = BTreeMap::new();
        outputs.insert("background_clear".to_string(), json!(true));
        let eval = evaluator().evaluate(&edge, &ctx_with_event(None), &outputs, &BTreeMap::new());
        assert!(eval.traversable);

        outputs.insert("background_clear".to_string(), json!(false));
        let eval = evaluator().evaluate(&edge, &ctx_with_event(None), &outputs, &BTreeMap::new());
        assert!(!eval.traversable);

        let eval = evaluator().evaluate(&edge, &ctx_with_event(None), &BTreeMap::new(), &BTreeMap::new());
        assert!(!eval.traversable);
        assert!(eval.reason.as_deref().unwrap().contains("no recorded output"));
    }

    #[test]
    fn policy_guard_accepts_passed_and_waived() {
        let edge = edge_with_guards(EdgeGuards {
            policies: vec!["kyc".to_string()],
            ..Default::default()
        });

        for (outcome, expected) in [
            (PolicyOutcome::Passed, true),
            (PolicyOutcome::Waived, true),
            (PolicyOutcome::Failed, false),
        ] {
            let mut outcomes = BTreeMap::new();
            outcomes.insert("kyc".to_string(), outcome);
            let eval = evaluator().evaluate(&edge, &ctx_with_event(None), &BTreeMap::new(), &outcomes);
            assert_eq!(eval.traversable, expected, "outcome {outcome:?}");
        }
    }

    #[test]
    fn event_guard_accepts_current_cycle_event() {
        let edge = edge_with_guards(EdgeGuards {
            events: vec!["AiAnalysisCompleted".to_string()],
            ..Default::default()
        });

        let eval = evaluator().evaluate(
            &edge,
            &ctx_with_event(Some("AiAnalysisCompleted")),
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        assert!(eval.traversable);

        let eval = evaluator().evaluate(&edge, &ctx_with_event(None), &BTreeMap::new(), &BTreeMap::new());
        assert!(!eval.traversable);
        assert!(eval.reason.as_deref().unwrap().contains("not observed"));
    }

    #[test]
    fn join_all_requires_every_branch() {
        let e1 = edge_with_guards(Default::default());
        let group_all_ready = vec![(&e1, true), (&e1, true), (&e1, true)];
        assert!(join_satisfied(JoinType::All, &group_all_ready).is_ok());

        let group_partial = vec![(&e1, true), (&e1, false), (&e1, true)];
        let err = join_satisfied(JoinType::All, &group_partial).unwrap_err();
        assert!(err.contains("2 of 3"));
    }

    #[test]
    fn join_any_and_n_of_m() {
        let e1 = edge_with_guards(Default::default());
        let group = vec![(&e1, false), (&e1, true), (&e1, false)];
        assert!(join_satisfied(JoinType::Any, &group).is_ok());
        assert!(join_satisfied(JoinType::NOfM { n: 1 }, &group).is_ok());
        assert!(join_satisfied(JoinType::NOfM { n: 2 }, &group).is_err());

        let none = vec![(&e1, false)];
        assert!(join_satisfied(JoinType::Any, &none).is_err());
    }
}
