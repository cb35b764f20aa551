//! Node evaluation: preconditions, business rules, policy gates.

use crate::context::RuntimeContext;
use crate::expression::ExpressionEvaluator;
use crate::types::{Node, NodeId, PolicyKind, PolicyOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of evaluating one node against a runtime context. Never an
/// error: evaluation failures land in `reason`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeEvaluation {
    pub node_id: NodeId,
    pub available: bool,
    pub reason: Option<String>,
    /// Rule outputs keyed by rule id, fed to outbound edge guards.
    pub rule_outputs: BTreeMap<String, Value>,
    /// Policy-gate outcomes keyed by policy id.
    pub policy_outcomes: BTreeMap<String, PolicyOutcome>,
}

impl NodeEvaluation {
    pub fn available(
        node_id: &str,
        rule_outputs: BTreeMap<String, Value>,
        policy_outcomes: BTreeMap<String, PolicyOutcome>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            available: true,
            reason: None,
            rule_outputs,
            policy_outcomes,
        }
    }

    pub fn blocked(node_id: &str, reason: impl Into<String>) -> Self {
        Self::blocked_with(node_id, reason, BTreeMap::new(), BTreeMap::new())
    }

    /// Blocked, but keeping whatever was evaluated before the block so the
    /// trace can show it.
    pub fn blocked_with(
        node_id: &str,
        reason: impl Into<String>,
        rule_outputs: BTreeMap<String, Value>,
        policy_outcomes: BTreeMap<String, PolicyOutcome>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            available: false,
            reason: Some(reason.into()),
            rule_outputs,
            policy_outcomes,
        }
    }
}

/// Evaluates a node's preconditions, rules, and policy gates in order.
pub struct NodeEvaluator {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl NodeEvaluator {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    pub fn evaluate(&self, node: &Node, ctx: &RuntimeContext) -> NodeEvaluation {
        let bindings = ctx.bindings();

        // 1. Preconditions: any false or failing expression blocks.
        for precondition in &node.preconditions {
            match self.evaluator.evaluate(precondition, &bindings) {
                Ok(ev) if ev.is_truthy() => {}
                Ok(_) => {
                    return NodeEvaluation::blocked(
                        &node.id,
                        format!("precondition `{precondition}` evaluated false"),
                    );
                }
                Err(e) => {
                    return NodeEvaluation::blocked(
                        &node.id,
                        format!("precondition `{precondition}` failed: {e}"),
                    );
                }
            }
        }

        // 2. Business rules in declared order; short-circuit on an
        //    unrecoverable evaluation error.
        let mut rule_outputs = BTreeMap::new();
        for rule in &node.rules {
            match self.evaluator.evaluate(&rule.expression, &bindings) {
                Ok(ev) => {
                    rule_outputs.insert(rule.id.clone(), ev.value);
                }
                Err(e) => {
                    return NodeEvaluation::blocked_with(
                        &node.id,
                        format!("rule `{}` evaluation failed: {e}", rule.id),
                        rule_outputs,
                        BTreeMap::new(),
                    );
                }
            }
        }

        // 3. Policy gates: collect every outcome first, then decide.
        let mut policy_outcomes = BTreeMap::new();
        for gate in &node.policy_gates {
            let passed = matches!(
                self.evaluator.evaluate(&gate.expression, &bindings),
                Ok(ev) if ev.is_truthy()
            );
            let outcome = if passed {
                PolicyOutcome::Passed
            } else if gate.kind == PolicyKind::Advisory
                && ctx.operational.waived_policies.contains(&gate.id)
            {
                PolicyOutcome::Waived
            } else {
                PolicyOutcome::Failed
            };
            policy_outcomes.insert(gate.id.clone(), outcome);
        }
        for gate in &node.policy_gates {
            if policy_outcomes.get(&gate.id) == Some(&PolicyOutcome::Failed) {
                let reason = match gate.kind {
                    PolicyKind::Statutory => {
                        format!("statutory policy `{}` failed", gate.id)
                    }
                    PolicyKind::Advisory => {
                        format!("policy `{}` failed without waiver", gate.id)
                    }
                };
                return NodeEvaluation::blocked_with(
                    &node.id,
                    reason,
                    rule_outputs,
                    policy_outcomes,
                );
            }
        }

        NodeEvaluation::available(&node.id, rule_outputs, policy_outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionContext, RuntimeContext};
    use crate::expression::SimpleExpressionEvaluator;
    use crate::types::{ActionSpec, ActionType, BusinessRule, PolicyGate};
    use serde_json::json;

    fn node_with(
        preconditions: Vec<&str>,
        rules: Vec<(&str, &str)>,
        gates: Vec<(&str, &str, PolicyKind)>,
    ) -> Node {
        Node {
            id: "N".to_string(),
            name: "N".to_string(),
            preconditions: preconditions.into_iter().map(str::to_string).collect(),
            rules: rules
                .into_iter()
                .map(|(id, expr)| BusinessRule {
                    id: id.to_string(),
                    expression: expr.to_string(),
                })
                .collect(),
            policy_gates: gates
                .into_iter()
                .map(|(id, expr, kind)| PolicyGate {
                    id: id.to_string(),
                    expression: expr.to_string(),
                    kind,
                })
                .collect(),
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

    fn ctx() -> RuntimeContext {
        let mut ec = ExecutionContext::default();
        ec.domain.insert("riskScore".to_string(), json!(55));
        ec.domain
            .insert("employee".to_string(), json!({"region": "EU"}));
        RuntimeContext::assemble(&ec, Default::default(), None)
    }

    fn evaluator() -> NodeEvaluator {
        NodeEvaluator::new(Arc::new(SimpleExpressionEvaluator::new()))
    }

    #[test]
    fn all_pass_collects_rule_outputs() {
        let node = node_with(
            vec!["employee.region = \"EU\""],
            vec![("risk", "riskScore"), ("eu", "employee.region = \"EU\"")],
            vec![("p1", "riskScore < 70", PolicyKind::Statutory)],
        );
        let eval = evaluator().evaluate(&node, &ctx());
        assert!(eval.available, "{:?}", eval.reason);
        assert_eq!(eval.rule_outputs.get("risk"), Some(&json!(55)));
        assert_eq!(eval.rule_outputs.get("eu"), Some(&json!(true)));
        assert_eq!(eval.policy_outcomes.get("p1"), Some(&PolicyOutcome::Passed));
    }

    #[test]
    fn false_precondition_blocks_with_reason() {
        let node = node_with(vec!["employee.region = \"US\""], vec![], vec![]);
        let eval = evaluator().evaluate(&node, &ctx());
        assert!(!eval.available);
        assert!(eval.reason.as_deref().unwrap().contains("precondition"));
    }

    #[test]
    fn rule_error_short_circuits_remaining_rules() {
        let node = node_with(
            vec![],
            vec![("bad", "ghost.binding = 1"), ("after", "alwaysTrue")],
            vec![],
        );
        let eval = evaluator().evaluate(&node, &ctx());
        assert!(!eval.available);
        assert!(eval.reason.as_deref().unwrap().contains("rule `bad`"));
        assert!(!eval.rule_outputs.contains_key("after"));
    }

    #[test]
    fn statutory_failure_blocks() {
        let node = node_with(
            vec![],
            vec![],
            vec![("stat", "riskScore < 10", PolicyKind::Statutory)],
        );
        let eval = evaluator().evaluate(&node, &ctx());
        assert!(!eval.available);
        assert_eq!(eval.policy_outcomes.get("stat"), Some(&PolicyOutcome::Failed));
        assert!(eval.reason.as_deref().unwrap().contains("statutory"));
    }

    #[test]
    fn advisory_failure_waived_in_operational_compartment() {
        let node = node_with(
            vec![],
            vec![],
            vec![("adv", "riskScore < 10", PolicyKind::Advisory)],
        );

        // Without a waiver: blocked.
        let eval = evaluator().evaluate(&node, &ctx());
        assert!(!eval.available);

        // With a waiver: available, outcome WAIVED.
        let mut ec = ExecutionContext::default();
        ec.domain.insert("riskScore".to_string(), json!(55));
        ec.operational.waived_policies.insert("adv".to_string());
        let waived_ctx = RuntimeContext::assemble(&ec, Default::default(), None);
        let eval = evaluator().evaluate(&node, &waived_ctx);
        assert!(eval.available, "{:?}", eval.reason);
        assert_eq!(eval.policy_outcomes.get("adv"), Some(&PolicyOutcome::Waived));
    }

    #[test]
    fn statutory_failure_is_not_waivable() {
        let node = node_with(
            vec![],
            vec![],
            vec![("stat", "riskScore < 10", PolicyKind::Statutory)],
        );
        let mut ec = ExecutionContext::default();
        ec.domain.insert("riskScore".to_string(), json!(55));
        ec.operational.waived_policies.insert("stat".to_string());
        let ctx = RuntimeContext::assemble(&ec, Default::default(), None);
        let eval = evaluator().evaluate(&node, &ctx);
        assert!(!eval.available);
        assert_eq!(eval.policy_outcomes.get("stat"), Some(&PolicyOutcome::Failed));
    }
}
