//! Process graph vocabulary: nodes, edges, guards, priorities, and the
//! execution/compensation semantics attached to them.
//!
//! Everything here is immutable plain data. Runtime state lives on
//! [`crate::instance::ProcessInstance`]; indices live on
//! [`crate::graph::ProcessGraph`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Scalar aliases ───────────────────────────────────────────

/// Graph-scoped node identifier (e.g. `CREATE_ACCOUNTS`).
pub type NodeId = String;

/// Graph-scoped edge identifier.
pub type EdgeId = String;

/// Priority assigned to entry-node actions, which have no in-edge.
pub const ENTRY_ACTION_PRIORITY: i32 = 100;

// ─── Actions ──────────────────────────────────────────────────

/// How a node's action executes. Polymorphic over the `execute` /
/// `report-completion` capability pair: synchronous kinds return a terminal
/// status from `execute`, asynchronous kinds return `PENDING` and complete
/// later via a `NodeCompleted` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    SystemInvocation,
    HumanTask,
    AgentAssisted,
    Composite,
}

/// Handler-specific action settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Wall-clock bound on a single `execute` call.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Opaque handler parameters.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// The action a node runs when selected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub handler_ref: String,
    #[serde(default)]
    pub config: ActionConfig,
}

// ─── Rules and policy gates ───────────────────────────────────

/// A business rule evaluated during node evaluation. Outputs are collected
/// keyed by rule id and fed to outbound edge guards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub id: String,
    pub expression: String,
}

/// Statutory gates block on failure unconditionally; advisory gates block
/// unless explicitly waived in the operational compartment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyKind {
    Statutory,
    Advisory,
}

/// A design-time policy gate declared on a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyGate {
    pub id: String,
    pub expression: String,
    #[serde(default = "PolicyGate::default_kind")]
    pub kind: PolicyKind,
}

impl PolicyGate {
    fn default_kind() -> PolicyKind {
        PolicyKind::Advisory
    }
}

/// Outcome of evaluating a policy gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyOutcome {
    Passed,
    Failed,
    Waived,
}

impl PolicyOutcome {
    /// Whether the outcome lets dependent guards pass.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PolicyOutcome::Passed | PolicyOutcome::Waived)
    }
}

// ─── Events and exception routing ─────────────────────────────

/// Event subscriptions and emissions declared on a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub subscribes: Vec<String>,
    #[serde(default)]
    pub emits: Vec<String>,
}

/// Where a node's failure routes when its in-edge escalates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRoute {
    /// Match a specific error kind; `None` is the catch-all.
    #[serde(default)]
    pub error_kind: Option<String>,
    pub target_node_id: NodeId,
}

/// Named context compartments, used to scope idempotency fingerprints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextCompartment {
    Client,
    Domain,
    EntityState,
    Operational,
    EventHistory,
}

// ─── Node ─────────────────────────────────────────────────────

/// An immutable process-graph node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Expressions that must all hold before the node is available.
    #[serde(default)]
    pub preconditions: Vec<String>,
    /// Business rules, evaluated in declared order.
    #[serde(default)]
    pub rules: Vec<BusinessRule>,
    /// Design-time policy gates.
    #[serde(default)]
    pub policy_gates: Vec<PolicyGate>,
    pub action: ActionSpec,
    #[serde(default)]
    pub events: EventConfig,
    #[serde(default)]
    pub exception_routes: Vec<ExceptionRoute>,
    /// Permissions the resolved principal must hold to execute this node.
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// Compartments fingerprinted for the idempotency key. Empty means
    /// the default scope (domain + entity state).
    #[serde(default)]
    pub input_compartments: Vec<ContextCompartment>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// ─── Edge guards, semantics, priority ─────────────────────────

/// The four guard compartments of an edge. All must hold for the edge to be
/// traversable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeGuards {
    /// Context expressions that must be truthy.
    #[serde(default)]
    pub context: Vec<String>,
    /// Rule ids that must have a truthy recorded output on the source node.
    #[serde(default)]
    pub rules: Vec<String>,
    /// Policy ids that must have a `PASSED` or `WAIVED` outcome.
    #[serde(default)]
    pub policies: Vec<String>,
    /// Event types that must appear in the event history (or be the
    /// triggering event of the current cycle).
    #[serde(default)]
    pub events: Vec<String>,
}

impl EdgeGuards {
    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.rules.is_empty()
            && self.policies.is_empty()
            && self.events.is_empty()
    }
}

/// How a parallel fan-in group releases its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinType {
    All,
    Any,
    NOfM { n: u32 },
}

/// Sequential edges hand off one at a time; parallel edges fan out and join
/// per their [`JoinType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionSemantics {
    Sequential,
    Parallel { join: JoinType },
}

impl Default for ExecutionSemantics {
    fn default() -> Self {
        ExecutionSemantics::Sequential
    }
}

impl ExecutionSemantics {
    pub fn is_parallel(&self) -> bool {
        matches!(self, ExecutionSemantics::Parallel { .. })
    }

    pub fn join_type(&self) -> Option<JoinType> {
        match self {
            ExecutionSemantics::Parallel { join } => Some(*join),
            ExecutionSemantics::Sequential => None,
        }
    }
}

/// Ordering weight of an edge. Higher weight sorts first; rank breaks ties
/// ascending; an exclusive edge preempts every other candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgePriority {
    pub weight: i32,
    pub rank: i32,
    pub exclusive: bool,
}

impl Default for EdgePriority {
    fn default() -> Self {
        Self {
            weight: 0,
            rank: 0,
            exclusive: false,
        }
    }
}

/// Recovery strategy when the action dispatched over this edge fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compensation {
    None,
    Retry { max: u32 },
    Escalate,
    Compensate { target_node_id: NodeId },
}

impl Default for Compensation {
    fn default() -> Self {
        Compensation::None
    }
}

// ─── Edge ─────────────────────────────────────────────────────

/// An immutable process-graph edge. References nodes by id only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    #[serde(default)]
    pub guards: EdgeGuards,
    #[serde(default)]
    pub semantics: ExecutionSemantics,
    #[serde(default)]
    pub priority: EdgePriority,
    /// Events whose arrival re-activates this edge for evaluation.
    #[serde(default)]
    pub activating_events: Vec<String>,
    #[serde(default)]
    pub compensation: Compensation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_type_serializes_with_screaming_tags() {
        let j = JoinType::NOfM { n: 2 };
        let json = serde_json::to_string(&j).unwrap();
        assert_eq!(json, r#"{"type":"N_OF_M","n":2}"#);
        let back: JoinType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, j);
    }

    #[test]
    fn edge_defaults_are_sequential_non_exclusive() {
        let edge: Edge = serde_yaml::from_str(
            r#"
            id: e1
            source_node_id: A
            target_node_id: B
            "#,
        )
        .unwrap();
        assert_eq!(edge.semantics, ExecutionSemantics::Sequential);
        assert_eq!(edge.priority.weight, 0);
        assert!(!edge.priority.exclusive);
        assert_eq!(edge.compensation, Compensation::None);
        assert!(edge.guards.is_empty());
    }

    #[test]
    fn policy_gate_defaults_to_advisory() {
        let gate: PolicyGate = serde_yaml::from_str(
            r#"
            id: p1
            expression: "riskRating != \"HIGH\""
            "#,
        )
        .unwrap();
        assert_eq!(gate.kind, PolicyKind::Advisory);
    }

    #[test]
    fn policy_outcome_satisfaction() {
        assert!(PolicyOutcome::Passed.is_satisfied());
        assert!(PolicyOutcome::Waived.is_satisfied());
        assert!(!PolicyOutcome::Failed.is_satisfied());
    }
}
