//! Pre-execution governance: idempotency, authorization, and the runtime
//! policy gate.
//!
//! Rejections are data, never exceptions. The orchestrator refuses to
//! dispatch any node whose most recent governance result was not approved.

use crate::config::GovernanceConfig;
use crate::context::RuntimeContext;
use crate::error::OrchestratorError;
use crate::expression::ExpressionEvaluator;
use crate::instance::ProcessInstance;
use crate::store::IdempotencyStore;
use crate::types::{ContextCompartment, Node, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

// ─── Check results ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyCheck {
    pub passed: bool,
    pub skipped: bool,
    pub key: Option<String>,
    pub previous_execution_id: Option<Uuid>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationCheck {
    pub passed: bool,
    pub skipped: bool,
    pub principal: Option<String>,
    pub missing_permissions: Vec<String>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyGateCheck {
    pub passed: bool,
    pub skipped: bool,
    /// Every policy id checked.
    pub checked: Vec<String>,
    /// The ids that failed.
    pub failed: Vec<String>,
    pub reason: String,
}

/// Combined result of the three checks, in evaluation order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernanceResult {
    pub approved: bool,
    pub idempotency: IdempotencyCheck,
    pub authorization: AuthorizationCheck,
    pub policy_gate: PolicyGateCheck,
}

impl GovernanceResult {
    /// The first failing check's reason, when rejected.
    pub fn rejection_reason(&self) -> Option<&str> {
        if self.approved {
            return None;
        }
        if !self.idempotency.passed {
            return Some(&self.idempotency.reason);
        }
        if !self.authorization.passed {
            return Some(&self.authorization.reason);
        }
        Some(&self.policy_gate.reason)
    }
}

// ─── Runtime policies ─────────────────────────────────────────

/// A runtime policy enforced by the governor, distinct from the design-time
/// policy gates declared on nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimePolicy {
    pub id: String,
    pub expression: String,
    /// Nodes the policy applies to. `None` applies it to every node.
    #[serde(default)]
    pub node_ids: Option<BTreeSet<NodeId>>,
}

impl RuntimePolicy {
    fn applies_to(&self, node_id: &str) -> bool {
        self.node_ids
            .as_ref()
            .map(|ids| ids.contains(node_id))
            .unwrap_or(true)
    }
}

// ─── Governor ─────────────────────────────────────────────────

/// Enforces the three pre-execution checks and records successful
/// executions in the idempotency store.
pub struct ExecutionGovernor {
    config: GovernanceConfig,
    store: Arc<dyn IdempotencyStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    policies: Vec<RuntimePolicy>,
}

impl ExecutionGovernor {
    pub fn new(
        config: GovernanceConfig,
        store: Arc<dyn IdempotencyStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        policies: Vec<RuntimePolicy>,
    ) -> Self {
        Self {
            config,
            store,
            evaluator,
            policies,
        }
    }

    /// Run the checks in order; `approved` only when all three pass.
    pub async fn enforce(
        &self,
        instance: &ProcessInstance,
        node: &Node,
        ctx: &RuntimeContext,
    ) -> Result<GovernanceResult, OrchestratorError> {
        let idempotency = self.check_idempotency(instance, node, ctx).await?;
        let authorization = self.check_authorization(node, ctx);
        let policy_gate = self.check_policy_gate(node, ctx);
        let approved = idempotency.passed && authorization.passed && policy_gate.passed;
        Ok(GovernanceResult {
            approved,
            idempotency,
            authorization,
            policy_gate,
        })
    }

    /// Record a successful execution. Called only after the executor
    /// reports success; `put_if_absent` keeps replays idempotent.
    pub async fn record_execution(
        &self,
        instance: &ProcessInstance,
        node: &Node,
        ctx: &RuntimeContext,
        execution_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        if !self.config.idempotency_enabled {
            return Ok(());
        }
        let key = self.idempotency_key(instance, node, ctx);
        if let Some(previous) = self.store.put_if_absent(&key, execution_id).await? {
            if previous != execution_id {
                tracing::warn!(
                    %key,
                    %previous,
                    %execution_id,
                    "idempotency key already recorded for a different execution"
                );
            }
        }
        Ok(())
    }

    /// Stable fingerprint of `{instance, node, declared input compartments}`.
    /// Undeclared inputs default to the domain and entity-state compartments.
    pub fn idempotency_key(
        &self,
        instance: &ProcessInstance,
        node: &Node,
        ctx: &RuntimeContext,
    ) -> String {
        let compartments: Vec<ContextCompartment> = if node.input_compartments.is_empty() {
            vec![ContextCompartment::Domain, ContextCompartment::EntityState]
        } else {
            node.input_compartments.clone()
        };

        let mut hasher = Sha256::new();
        hasher.update(instance.instance_id.as_bytes());
        hasher.update(node.id.as_bytes());
        for compartment in compartments {
            let fingerprint = match compartment {
                ContextCompartment::Client => serde_json::to_vec(&ctx.client),
                ContextCompartment::Domain => serde_json::to_vec(&ctx.domain),
                ContextCompartment::EntityState => serde_json::to_vec(&ctx.entity_state),
                ContextCompartment::Operational => serde_json::to_vec(&ctx.operational),
                ContextCompartment::EventHistory => serde_json::to_vec(&ctx.event_history),
            };
            if let Ok(bytes) = fingerprint {
                hasher.update(&bytes);
            }
        }
        format!(
            "{}:{}:{}",
            instance.instance_id,
            node.id,
            hex_digest(&hasher.finalize())
        )
    }

    async fn check_idempotency(
        &self,
        instance: &ProcessInstance,
        node: &Node,
        ctx: &RuntimeContext,
    ) -> Result<IdempotencyCheck, OrchestratorError> {
        if !self.config.idempotency_enabled {
            return Ok(IdempotencyCheck {
                passed: true,
                skipped: true,
                key: None,
                previous_execution_id: None,
                reason: "idempotency check disabled".to_string(),
            });
        }
        let key = self.idempotency_key(instance, node, ctx);
        match self.store.get(&key).await? {
            Some(previous) => Ok(IdempotencyCheck {
                passed: false,
                skipped: false,
                key: Some(key),
                previous_execution_id: Some(previous),
                reason: format!("already executed as {previous}"),
            }),
            None => Ok(IdempotencyCheck {
                passed: true,
                skipped: false,
                key: Some(key),
                previous_execution_id: None,
                reason: "no prior execution recorded".to_string(),
            }),
        }
    }

    fn check_authorization(&self, node: &Node, ctx: &RuntimeContext) -> AuthorizationCheck {
        if !self.config.authorization_enabled {
            return AuthorizationCheck {
                passed: true,
                skipped: true,
                principal: None,
                missing_permissions: vec![],
                reason: "authorization check disabled".to_string(),
            };
        }
        if node.required_permissions.is_empty() {
            return AuthorizationCheck {
                passed: true,
                skipped: false,
                principal: resolve_principal(ctx),
                missing_permissions: vec![],
                reason: "node declares no required permissions".to_string(),
            };
        }

        let principal = resolve_principal(ctx);
        let granted = granted_permissions(ctx);
        let missing: Vec<String> = node
            .required_permissions
            .iter()
            .filter(|p| !granted.contains(p.as_str()))
            .cloned()
            .collect();

        match (&principal, missing.is_empty()) {
            (Some(who), true) => AuthorizationCheck {
                passed: true,
                skipped: false,
                principal: principal.clone(),
                missing_permissions: vec![],
                reason: format!("principal {who} holds every required permission"),
            },
            (Some(who), false) => AuthorizationCheck {
                passed: false,
                skipped: false,
                principal: principal.clone(),
                reason: format!("principal {who} lacks permissions: {}", missing.join(", ")),
                missing_permissions: missing,
            },
            (None, _) => AuthorizationCheck {
                passed: false,
                skipped: false,
                principal: None,
                reason: "no principal resolved from context".to_string(),
                missing_permissions: missing,
            },
        }
    }

    fn check_policy_gate(&self, node: &Node, ctx: &RuntimeContext) -> PolicyGateCheck {
        if !self.config.policy_gate_enabled {
            return PolicyGateCheck {
                passed: true,
                skipped: true,
                checked: vec![],
                failed: vec![],
                reason: "policy gate disabled".to_string(),
            };
        }

        let bindings = ctx.bindings();
        let mut checked = Vec::new();
        let mut failed = Vec::new();
        for policy in self.policies.iter().filter(|p| p.applies_to(&node.id)) {
            checked.push(policy.id.clone());
            let holds = matches!(
                self.evaluator.evaluate(&policy.expression, &bindings),
                Ok(ev) if ev.is_truthy()
            );
            if !holds {
                failed.push(policy.id.clone());
            }
        }

        if failed.is_empty() {
            PolicyGateCheck {
                passed: true,
                reason: format!("{} runtime policies passed", checked.len()),
                skipped: false,
                checked,
                failed,
            }
        } else {
            PolicyGateCheck {
                passed: false,
                reason: format!("runtime policies failed: {}", failed.join(", ")),
                skipped: false,
                checked,
                failed,
            }
        }
    }
}

/// The principal is the `principal` key of the client compartment.
fn resolve_principal(ctx: &RuntimeContext) -> Option<String> {
    ctx.client
        .get("principal")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Permissions granted to the principal: the `permissions` array of the
/// client compartment.
fn granted_permissions(ctx: &RuntimeContext) -> BTreeSet<&str> {
    ctx.client
        .get("permissions")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernanceConfig;
    use crate::context::{ExecutionContext, RuntimeContext};
    use crate::expression::SimpleExpressionEvaluator;
    use crate::graph::{GraphDefinition, ProcessGraph};
    use crate::store_memory::InMemoryIdempotencyStore;
    use crate::types::{ActionSpec, ActionType};
    use serde_json::json;

    fn node(id: &str, permissions: Vec<&str>) -> Node {
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
            required_permissions: permissions.into_iter().map(str::to_string).collect(),
            input_compartments: vec![],
            metadata: Default::default(),
        }
    }

    fn graph(nodes: Vec<Node>) -> ProcessGraph {
        let entry = nodes[0].id.clone();
        ProcessGraph::from_definition(GraphDefinition {
            id: "g".to_string(),
            version: 1,
            metadata: Default::default(),
            entry_node_ids: vec![entry.clone()],
            terminal_node_ids: vec![entry],
            nodes,
            edges: vec![],
        })
    }

    fn instance_with_client(client: Vec<(&str, Value)>) -> ProcessInstance {
        let mut ec = ExecutionContext::default();
        for (k, v) in client {
            ec.client.insert(k.to_string(), v);
        }
        ec.domain.insert("riskScore".to_string(), json!(20));
        ProcessInstance::new(&graph(vec![node("A", vec![])]), None, ec)
    }

    fn rt(instance: &ProcessInstance) -> RuntimeContext {
        RuntimeContext::assemble(&instance.context, Default::default(), None)
    }

    fn governor(config: GovernanceConfig, policies: Vec<RuntimePolicy>) -> ExecutionGovernor {
        ExecutionGovernor::new(
            config,
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(SimpleExpressionEvaluator::new()),
            policies,
        )
    }

    #[tokio::test]
    async fn approves_when_all_checks_pass() {
        let inst = instance_with_client(vec![
            ("principal", json!("ops@acme")),
            ("permissions", json!(["hr.create"])),
        ]);
        let n = node("A", vec!["hr.create"]);
        let gov = governor(GovernanceConfig::default(), vec![]);
        let result = gov.enforce(&inst, &n, &rt(&inst)).await.unwrap();
        assert!(result.approved, "{:?}", result);
        assert!(result.idempotency.key.is_some());
        assert_eq!(result.rejection_reason(), None);
    }

    #[tokio::test]
    async fn recorded_execution_fails_second_enforce() {
        let inst = instance_with_client(vec![]);
        let n = node("A", vec![]);
        let gov = governor(GovernanceConfig::default(), vec![]);

        let first = gov.enforce(&inst, &n, &rt(&inst)).await.unwrap();
        assert!(first.approved);

        let exec_id = Uuid::now_v7();
        gov.record_execution(&inst, &n, &rt(&inst), exec_id)
            .await
            .unwrap();

        let second = gov.enforce(&inst, &n, &rt(&inst)).await.unwrap();
        assert!(!second.approved);
        assert_eq!(second.idempotency.previous_execution_id, Some(exec_id));
        assert!(second
            .rejection_reason()
            .unwrap()
            .contains("already executed"));
    }

    #[tokio::test]
    async fn key_is_stable_and_context_sensitive() {
        let inst = instance_with_client(vec![]);
        let n = node("A", vec![]);
        let gov = governor(GovernanceConfig::default(), vec![]);

        let k1 = gov.idempotency_key(&inst, &n, &rt(&inst));
        let k2 = gov.idempotency_key(&inst, &n, &rt(&inst));
        assert_eq!(k1, k2);
        assert!(k1.starts_with(&format!("{}:A:", inst.instance_id)));

        let mut changed = inst.clone();
        changed
            .context
            .domain
            .insert("riskScore".to_string(), json!(99));
        let k3 = gov.idempotency_key(&changed, &n, &rt(&changed));
        assert_ne!(k1, k3, "domain compartment is in the default scope");
    }

    #[tokio::test]
    async fn missing_permission_is_unauthorized() {
        let inst = instance_with_client(vec![
            ("principal", json!("temp@acme")),
            ("permissions", json!(["hr.read"])),
        ]);
        let n = node("A", vec!["hr.create", "hr.read"]);
        let gov = governor(GovernanceConfig::default(), vec![]);
        let result = gov.enforce(&inst, &n, &rt(&inst)).await.unwrap();
        assert!(!result.approved);
        assert_eq!(result.authorization.missing_permissions, vec!["hr.create"]);
        assert!(result.rejection_reason().unwrap().contains("lacks permissions"));
    }

    #[tokio::test]
    async fn no_principal_fails_when_permissions_required() {
        let inst = instance_with_client(vec![]);
        let n = node("A", vec!["hr.create"]);
        let gov = governor(GovernanceConfig::default(), vec![]);
        let result = gov.enforce(&inst, &n, &rt(&inst)).await.unwrap();
        assert!(!result.approved);
        assert_eq!(result.authorization.principal, None);
    }

    #[tokio::test]
    async fn runtime_policy_failure_blocks() {
        let inst = instance_with_client(vec![]);
        let n = node("A", vec![]);
        let gov = governor(
            GovernanceConfig::default(),
            vec![RuntimePolicy {
                id: "risk-cap".to_string(),
                expression: "riskScore < 10".to_string(),
                node_ids: None,
            }],
        );
        let result = gov.enforce(&inst, &n, &rt(&inst)).await.unwrap();
        assert!(!result.approved);
        assert_eq!(result.policy_gate.failed, vec!["risk-cap"]);
    }

    #[tokio::test]
    async fn scoped_policy_skips_other_nodes() {
        let inst = instance_with_client(vec![]);
        let n = node("A", vec![]);
        let gov = governor(
            GovernanceConfig::default(),
            vec![RuntimePolicy {
                id: "only-b".to_string(),
                expression: "riskScore < 10".to_string(),
                node_ids: Some(BTreeSet::from(["B".to_string()])),
            }],
        );
        let result = gov.enforce(&inst, &n, &rt(&inst)).await.unwrap();
        assert!(result.approved);
        assert!(result.policy_gate.checked.is_empty());
    }

    #[tokio::test]
    async fn disabled_checks_are_skipped() {
        let inst = instance_with_client(vec![]);
        let n = node("A", vec!["hr.create"]);
        let gov = governor(
            GovernanceConfig {
                idempotency_enabled: false,
                authorization_enabled: false,
                policy_gate_enabled: false,
            },
            vec![RuntimePolicy {
                id: "never".to_string(),
                expression: "alwaysFalse".to_string(),
                node_ids: None,
            }],
        );
        let result = gov.enforce(&inst, &n, &rt(&inst)).await.unwrap();
        assert!(result.approved);
        assert!(result.idempotency.skipped);
        assert!(result.authorization.skipped);
        assert!(result.policy_gate.skipped);
    }
}
