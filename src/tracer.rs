//! Decision tracing: the immutable audit record for every orchestration
//! cycle.
//!
//! One trace per cycle, regardless of outcome. Traces are logged at an
//! outcome-appropriate level and, when enabled, appended to the trace
//! repository. Nothing ever mutates a recorded trace.

use crate::config::TracingConfig;
use crate::context::RuntimeContext;
use crate::decider::{DecisionType, NavigationDecision, SelectionCriteria};
use crate::error::OrchestratorError;
use crate::eval::edge::EdgeEvaluation;
use crate::eval::node::NodeEvaluation;
use crate::governor::GovernanceResult;
use crate::store::DecisionTraceRepository;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

// ─── Trace model ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceType {
    Navigation,
    Execution,
    Wait,
    Blocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceOutcome {
    Executed,
    Waiting,
    Blocked,
    Failed,
}

/// Context compartments at decision time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub client: BTreeMap<String, Value>,
    pub domain: BTreeMap<String, Value>,
    pub entity_state: BTreeMap<String, Value>,
    pub system_state: String,
    pub current_event_type: Option<String>,
}

impl ContextSnapshot {
    pub fn of(ctx: &RuntimeContext) -> Self {
        Self {
            client: ctx.client.clone(),
            domain: ctx.domain.clone(),
            entity_state: ctx.entity_state.clone(),
            system_state: format!("{:?}", ctx.operational.system_state),
            current_event_type: ctx.current_event.as_ref().map(|e| e.event_type.clone()),
        }
    }
}

/// Per-node evaluation summary kept in the trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeEvaluationSummary {
    pub node_id: String,
    pub available: bool,
    pub reason: Option<String>,
}

impl From<&NodeEvaluation> for NodeEvaluationSummary {
    fn from(eval: &NodeEvaluation) -> Self {
        Self {
            node_id: eval.node_id.clone(),
            available: eval.available,
            reason: eval.reason.clone(),
        }
    }
}

/// Per-edge evaluation summary kept in the trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeEvaluationSummary {
    pub edge_id: String,
    pub traversable: bool,
    pub reason: Option<String>,
}

impl From<&EdgeEvaluation> for EdgeEvaluationSummary {
    fn from(eval: &EdgeEvaluation) -> Self {
        Self {
            edge_id: eval.edge_id.clone(),
            traversable: eval.traversable,
            reason: eval.reason.clone(),
        }
    }
}

/// The selection, as recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionSnapshot {
    pub decision: DecisionType,
    pub selected_nodes: Vec<String>,
    pub selection_criteria: SelectionCriteria,
    pub selection_reason: String,
    pub constraints_relaxed: bool,
    pub alternatives: Vec<crate::decider::Alternative>,
}

/// Immutable audit record for one orchestration cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub trace_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub instance_id: Uuid,
    pub trace_type: TraceType,
    pub context: ContextSnapshot,
    pub node_evaluations: Vec<NodeEvaluationSummary>,
    pub edge_evaluations: Vec<EdgeEvaluationSummary>,
    pub decision: DecisionSnapshot,
    /// Governance results for the dispatched node(s), in dispatch order.
    pub governance: Vec<GovernanceResult>,
    pub outcome: TraceOutcome,
    pub detail: Option<String>,
}

impl DecisionTrace {
    /// Build the trace for a decided cycle.
    pub fn from_decision(
        instance_id: Uuid,
        trace_type: TraceType,
        ctx: &RuntimeContext,
        decision: &NavigationDecision,
        governance: Vec<GovernanceResult>,
        outcome: TraceOutcome,
        detail: Option<String>,
    ) -> Self {
        Self {
            trace_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            instance_id,
            trace_type,
            context: ContextSnapshot::of(ctx),
            node_evaluations: decision
                .eligible_space
                .eligible_nodes
                .iter()
                .map(NodeEvaluationSummary::from)
                .collect(),
            edge_evaluations: decision
                .eligible_space
                .traversable_edges
                .iter()
                .map(EdgeEvaluationSummary::from)
                .collect(),
            decision: DecisionSnapshot {
                decision: decision.decision,
                selected_nodes: decision.selected_nodes.clone(),
                selection_criteria: decision.selection_criteria,
                selection_reason: decision.selection_reason.clone(),
                constraints_relaxed: decision.constraints_relaxed,
                alternatives: decision.alternatives.clone(),
            },
            governance,
            outcome,
            detail,
        }
    }

    /// Minimal trace for events absorbed without a cycle (cancelled
    /// instances, ghost signals).
    pub fn absorbed(
        instance_id: Uuid,
        outcome: TraceOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            instance_id,
            trace_type: TraceType::Wait,
            context: ContextSnapshot::default(),
            node_evaluations: vec![],
            edge_evaluations: vec![],
            decision: DecisionSnapshot {
                decision: DecisionType::Wait,
                selected_nodes: vec![],
                selection_criteria: SelectionCriteria::NoOptions,
                selection_reason: String::new(),
                constraints_relaxed: false,
                alternatives: vec![],
            },
            governance: vec![],
            outcome,
            detail: Some(detail.into()),
        }
    }
}

// ─── Tracer ───────────────────────────────────────────────────

/// Builds log records and persists traces per the tracing configuration.
pub struct DecisionTracer {
    repo: Option<Arc<dyn DecisionTraceRepository>>,
    config: TracingConfig,
}

impl DecisionTracer {
    pub fn new(repo: Arc<dyn DecisionTraceRepository>, config: TracingConfig) -> Self {
        Self {
            repo: Some(repo),
            config,
        }
    }

    /// A tracer that only logs; nothing is persisted.
    pub fn without_persistence(config: TracingConfig) -> Self {
        Self { repo: None, config }
    }

    /// Record one trace: log at the outcome-appropriate level, then append
    /// to the repository when persistence is on. Returns the trace id.
    pub async fn record(&self, trace: DecisionTrace) -> Result<Uuid, OrchestratorError> {
        if self.config.enabled {
            match trace.trace_type {
                TraceType::Execution | TraceType::Navigation => tracing::info!(
                    instance_id = %trace.instance_id,
                    trace_id = %trace.trace_id,
                    trace_type = ?trace.trace_type,
                    outcome = ?trace.outcome,
                    selected = ?trace.decision.selected_nodes,
                    reason = %trace.decision.selection_reason,
                    "decision trace"
                ),
                TraceType::Wait => tracing::debug!(
                    instance_id = %trace.instance_id,
                    trace_id = %trace.trace_id,
                    reason = %trace.decision.selection_reason,
                    "cycle waiting"
                ),
                TraceType::Blocked => tracing::warn!(
                    instance_id = %trace.instance_id,
                    trace_id = %trace.trace_id,
                    detail = ?trace.detail,
                    "cycle blocked"
                ),
            }
        }

        let trace_id = trace.trace_id;
        if self.config.persist_traces {
            if let Some(repo) = &self.repo {
                repo.save(&trace).await?;
            }
        }
        Ok(trace_id)
    }

    /// Prune persisted traces older than `cutoff`; returns how many went.
    pub async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, OrchestratorError> {
        match &self.repo {
            Some(repo) => Ok(repo.delete_older_than(cutoff).await?),
            None => Ok(0),
        }
    }

    /// Retention cutoff derived from `trace_retention_days`.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.config.trace_retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::eval::eligibility::EligibleSpace;
    use crate::store_memory::InMemoryTraceRepository;

    fn decision() -> NavigationDecision {
        NavigationDecision {
            decision: DecisionType::Wait,
            selected_nodes: vec![],
            alternatives: vec![],
            selection_criteria: SelectionCriteria::NoOptions,
            selection_reason: "no eligible actions".to_string(),
            constraints_relaxed: false,
            eligible_space: EligibleSpace {
                eligible_nodes: vec![NodeEvaluation::blocked("B", "precondition false")],
                traversable_edges: vec![EdgeEvaluation::not_traversable("e1", "guard false")],
                candidate_actions: vec![],
                evaluated_at: Utc::now(),
            },
            decided_at: Utc::now(),
        }
    }

    fn runtime_ctx() -> RuntimeContext {
        RuntimeContext::assemble(&ExecutionContext::default(), Default::default(), None)
    }

    #[tokio::test]
    async fn record_returns_trace_id_without_persistence() {
        let tracer = DecisionTracer::without_persistence(TracingConfig::default());
        let trace = DecisionTrace::from_decision(
            Uuid::now_v7(),
            TraceType::Wait,
            &runtime_ctx(),
            &decision(),
            vec![],
            TraceOutcome::Waiting,
            None,
        );
        let expected = trace.trace_id;
        let recorded = tracer.record(trace).await.unwrap();
        assert_eq!(recorded, expected);
    }

    #[tokio::test]
    async fn trace_round_trips_through_repository_bit_identically() {
        let repo = Arc::new(InMemoryTraceRepository::new());
        let tracer = DecisionTracer::new(repo.clone(), TracingConfig::default());

        let trace = DecisionTrace::from_decision(
            Uuid::now_v7(),
            TraceType::Wait,
            &runtime_ctx(),
            &decision(),
            vec![],
            TraceOutcome::Waiting,
            Some("wait detail".to_string()),
        );
        let original = trace.clone();
        let id = tracer.record(trace).await.unwrap();

        use crate::store::DecisionTraceRepository as _;
        let loaded = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(loaded, original);

        // Field-level serde round trip too.
        let json = serde_json::to_string(&loaded).unwrap();
        let back: DecisionTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[tokio::test]
    async fn persistence_disabled_skips_the_repository() {
        let repo = Arc::new(InMemoryTraceRepository::new());
        let tracer = DecisionTracer::new(
            repo.clone(),
            TracingConfig {
                persist_traces: false,
                ..Default::default()
            },
        );
        let trace = DecisionTrace::absorbed(Uuid::now_v7(), TraceOutcome::Waiting, "dropped");
        let instance_id = trace.instance_id;
        tracer.record(trace).await.unwrap();

        use crate::store::DecisionTraceRepository as _;
        assert!(repo.find_by_instance_id(instance_id).await.unwrap().is_empty());
    }

    #[test]
    fn retention_cutoff_uses_configured_days() {
        let tracer = DecisionTracer::without_persistence(TracingConfig {
            trace_retention_days: 90,
            ..Default::default()
        });
        let now = Utc::now();
        assert_eq!(tracer.retention_cutoff(now), now - Duration::days(90));
    }
}
