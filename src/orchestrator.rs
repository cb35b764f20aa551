//! The single-step orchestration cycle.
//!
//! One cycle: assemble context → compute the eligible space → select →
//! govern → dispatch → mutate the instance → record exactly one decision
//! trace. Progression is event-driven: the cycle never loops on its own,
//! it returns follow-up events for the runtime to enqueue.

use crate::context::{ContextAssembler, RuntimeContext};
use crate::decider::{
    DecisionType, DependencyConstraints, NavigationDecider, NavigationDecision,
};
use crate::error::OrchestratorError;
use crate::eval::eligibility::{CandidateAction, EligibilityEvaluator};
use crate::events::{EventPayload, ProcessEvent};
use crate::executor::{ActionResult, ActionStatus, ExecutorRegistry};
use crate::governor::{ExecutionGovernor, GovernanceResult};
use crate::graph::ProcessGraph;
use crate::instance::ProcessInstance;
use crate::store::ProcessInstanceRepository;
use crate::tracer::{DecisionTrace, DecisionTracer, TraceOutcome, TraceType};
use crate::types::Compensation;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

// ─── Result ───────────────────────────────────────────────────

/// Per-cycle status reported to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleOutcome {
    Executed,
    Waiting,
    Blocked,
    Completed,
    Failed,
}

/// What one `orchestrate*` invocation produced.
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestrationResult {
    pub outcome: CycleOutcome,
    pub trace_id: Option<Uuid>,
    pub detail: Option<String>,
    /// Events the runtime should enqueue to drive the next cycle.
    pub followup_events: Vec<ProcessEvent>,
}

impl OrchestrationResult {
    fn new(outcome: CycleOutcome, trace_id: Uuid, detail: Option<String>) -> Self {
        Self {
            outcome,
            trace_id: Some(trace_id),
            detail,
            followup_events: vec![],
        }
    }

    fn with_followups(mut self, events: Vec<ProcessEvent>) -> Self {
        self.followup_events = events;
        self
    }
}

enum CycleMode {
    Steady,
    Entry,
    Event(ProcessEvent),
}

// ─── Orchestrator ─────────────────────────────────────────────

/// Drives one instance through one cycle at a time.
pub struct InstanceOrchestrator {
    assembler: ContextAssembler,
    eligibility: EligibilityEvaluator,
    decider: NavigationDecider,
    governor: ExecutionGovernor,
    registry: Arc<ExecutorRegistry>,
    tracer: Arc<DecisionTracer>,
    instances: Arc<dyn ProcessInstanceRepository>,
    constraints: DependencyConstraints,
}

impl InstanceOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        assembler: ContextAssembler,
        eligibility: EligibilityEvaluator,
        decider: NavigationDecider,
        governor: ExecutionGovernor,
        registry: Arc<ExecutorRegistry>,
        tracer: Arc<DecisionTracer>,
        instances: Arc<dyn ProcessInstanceRepository>,
    ) -> Self {
        Self {
            assembler,
            eligibility,
            decider,
            governor,
            registry,
            tracer,
            instances,
            constraints: DependencyConstraints::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: DependencyConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn tracer(&self) -> &Arc<DecisionTracer> {
        &self.tracer
    }

    /// Steady-state cycle.
    pub async fn orchestrate(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        tenant_id: Option<&str>,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        self.run_cycle(instance, graph, tenant_id, CycleMode::Steady).await
    }

    /// First cycle of a fresh instance: entry nodes only.
    pub async fn orchestrate_entry(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        tenant_id: Option<&str>,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        self.run_cycle(instance, graph, tenant_id, CycleMode::Entry).await
    }

    /// Event-triggered cycle: applies the event's effects, then evaluates
    /// with candidate sets biased toward subscribers and activated edges.
    pub async fn reevaluate_after_event(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        tenant_id: Option<&str>,
        event: &ProcessEvent,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        self.run_cycle(instance, graph, tenant_id, CycleMode::Event(event.clone()))
            .await
    }

    async fn run_cycle(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        tenant_id: Option<&str>,
        mode: CycleMode,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let current_event = match &mode {
            CycleMode::Event(event) => {
                let record = event.to_record();
                instance.context.record_event(record.clone());
                self.apply_event_effects(instance, graph, event)?;
                Some(record)
            }
            _ => None,
        };

        let ctx = self.assembler.assemble(instance, tenant_id, current_event).await?;
        let space = match &mode {
            CycleMode::Steady => self.eligibility.evaluate(instance, graph, &ctx),
            CycleMode::Entry => self.eligibility.evaluate_entry(instance, graph, &ctx),
            CycleMode::Event(event) => {
                self.eligibility
                    .reevaluate_after_event(instance, graph, &ctx, &event.event_type())
            }
        };
        let decision = self.decider.select(space, instance, graph, &self.constraints);

        match decision.decision {
            DecisionType::Wait => {
                let detail = decision.selection_reason.clone();
                let trace_id = self
                    .record(instance, TraceType::Wait, &ctx, &decision, vec![], TraceOutcome::Waiting, None)
                    .await?;
                self.instances.save(instance).await?;
                Ok(OrchestrationResult::new(CycleOutcome::Waiting, trace_id, Some(detail)))
            }
            DecisionType::Complete => {
                instance.complete();
                let trace_id = self
                    .record(
                        instance,
                        TraceType::Navigation,
                        &ctx,
                        &decision,
                        vec![],
                        TraceOutcome::Executed,
                        Some("instance completed".to_string()),
                    )
                    .await?;
                self.instances.save(instance).await?;
                Ok(OrchestrationResult::new(
                    CycleOutcome::Completed,
                    trace_id,
                    Some("all terminal nodes reached".to_string()),
                ))
            }
            DecisionType::Blocked => {
                let detail = decision.selection_reason.clone();
                let trace_id = self
                    .record(instance, TraceType::Blocked, &ctx, &decision, vec![], TraceOutcome::Blocked, Some(detail.clone()))
                    .await?;
                self.instances.save(instance).await?;
                Ok(OrchestrationResult::new(CycleOutcome::Blocked, trace_id, Some(detail)))
            }
            DecisionType::Proceed => self.dispatch_selected(instance, graph, &ctx, decision).await,
        }
    }

    /// Governance, dispatch, and result application for the selected nodes.
    async fn dispatch_selected(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        ctx: &RuntimeContext,
        decision: NavigationDecision,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let selected: Vec<CandidateAction> = decision
            .selected_nodes
            .iter()
            .filter_map(|node_id| {
                decision
                    .eligible_space
                    .candidate_actions
                    .iter()
                    .find(|a| &a.node_id == node_id)
            })
            .cloned()
            .collect();

        // A node that already completed coerces this slot to WAIT.
        let runnable: Vec<CandidateAction> = selected
            .into_iter()
            .filter(|a| !instance.has_executed_node(&a.node_id))
            .collect();
        if runnable.is_empty() {
            let trace_id = self
                .record(
                    instance,
                    TraceType::Wait,
                    ctx,
                    &decision,
                    vec![],
                    TraceOutcome::Waiting,
                    Some("selected nodes already executed".to_string()),
                )
                .await?;
            self.instances.save(instance).await?;
            return Ok(OrchestrationResult::new(
                CycleOutcome::Waiting,
                trace_id,
                Some("selected nodes already executed".to_string()),
            ));
        }

        // Governance for every slot before anything dispatches. The first
        // rejection blocks the cycle; the executor is never called for a
        // node whose latest governance result was not approved.
        let mut governance: Vec<GovernanceResult> = Vec::new();
        for action in &runnable {
            let node = graph
                .node(&action.node_id)
                .ok_or_else(|| OrchestratorError::NodeNotFound(action.node_id.clone()))?;
            let result = self.governor.enforce(instance, node, ctx).await?;
            let approved = result.approved;
            let reason = result
                .rejection_reason()
                .unwrap_or("governance rejected")
                .to_string();
            governance.push(result);
            if !approved {
                let trace_id = self
                    .record(
                        instance,
                        TraceType::Blocked,
                        ctx,
                        &decision,
                        governance,
                        TraceOutcome::Blocked,
                        Some(reason.clone()),
                    )
                    .await?;
                self.instances.save(instance).await?;
                return Ok(OrchestrationResult::new(CycleOutcome::Blocked, trace_id, Some(reason)));
            }
        }

        // Open execution records, then dispatch every slot concurrently.
        let mut dispatches: Vec<(CandidateAction, Uuid)> = Vec::new();
        for action in &runnable {
            let execution_id = Uuid::now_v7();
            instance.start_node_execution(&action.node_id, execution_id, action.edge_id.clone())?;
            dispatches.push((action.clone(), execution_id));
        }

        let mut handles = Vec::new();
        for (action, _) in &dispatches {
            let node = graph
                .node(&action.node_id)
                .ok_or_else(|| OrchestratorError::NodeNotFound(action.node_id.clone()))?
                .clone();
            let registry = self.registry.clone();
            let snapshot = instance.clone();
            let task_ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                registry.dispatch(&node, &snapshot, &task_ctx).await
            }));
        }
        let mut results: Vec<ActionResult> = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|e| {
                ActionResult::failed(format!("executor task aborted: {e}"), false)
            }));
        }

        // Apply the results in dispatch order.
        let mut followups: Vec<ProcessEvent> = Vec::new();
        let mut notes: Vec<String> = Vec::new();
        let mut any_success = false;
        let mut any_failure = false;
        for ((action, execution_id), result) in dispatches.iter().zip(results) {
            let node_id = &action.node_id;
            match result.status {
                ActionStatus::Success => {
                    let started_at = instance
                        .latest_execution(node_id)
                        .map(|e| e.started_at)
                        .unwrap_or_else(Utc::now);
                    instance.complete_node_execution(node_id, result.output.clone())?;
                    let node = graph
                        .node(node_id)
                        .ok_or_else(|| OrchestratorError::NodeNotFound(node_id.clone()))?;
                    self.governor
                        .record_execution(instance, node, ctx, *execution_id)
                        .await?;
                    let duration_ms =
                        (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                    followups.push(ProcessEvent::new(EventPayload::NodeCompleted {
                        instance_id: instance.instance_id,
                        node_id: node_id.clone(),
                        result: result.output.clone().unwrap_or(Value::Null),
                        duration_ms,
                    }));
                    notes.push(format!("{node_id} completed"));
                    any_success = true;
                }
                ActionStatus::Pending => {
                    // The record stays RUNNING; a NodeCompleted event closes
                    // it later.
                    notes.push(format!("{node_id} pending external completion"));
                }
                ActionStatus::Failed => {
                    any_failure = true;
                    let error = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "action failed".to_string());
                    let compensation = action
                        .edge_id
                        .as_deref()
                        .and_then(|id| graph.edge(id))
                        .map(|e| e.compensation.clone())
                        .unwrap_or(Compensation::None);
                    match compensation {
                        Compensation::Retry { max }
                            if instance.failed_attempts(node_id) < max =>
                        {
                            instance.mark_node_failed(node_id, &error)?;
                            followups.push(ProcessEvent::new(EventPayload::NodeFailed {
                                instance_id: instance.instance_id,
                                node_id: node_id.clone(),
                                error_type: "action_failed".to_string(),
                                error_message: error.clone(),
                                retry_count: instance.failed_attempts(node_id),
                                retryable: true,
                            }));
                            notes.push(format!("{node_id} failed (retryable): {error}"));
                        }
                        Compensation::Escalate | Compensation::Compensate { .. } => {
                            instance.mark_node_failed(node_id, &error)?;
                            followups.push(ProcessEvent::new(EventPayload::NodeFailed {
                                instance_id: instance.instance_id,
                                node_id: node_id.clone(),
                                error_type: "action_failed".to_string(),
                                error_message: error.clone(),
                                retry_count: instance.failed_attempts(node_id),
                                retryable: false,
                            }));
                            notes.push(format!("{node_id} failed, routed for recovery: {error}"));
                        }
                        _ => {
                            instance.fail_node_execution(node_id, &error)?;
                            notes.push(format!("{node_id} failed: {error}"));
                        }
                    }
                }
            }
        }

        let outcome_summary = notes.join("; ");
        let (cycle_outcome, trace_outcome) = if any_failure {
            (CycleOutcome::Failed, TraceOutcome::Failed)
        } else if any_success {
            (CycleOutcome::Executed, TraceOutcome::Executed)
        } else {
            // Everything pending: dispatched, awaiting completion events.
            (CycleOutcome::Executed, TraceOutcome::Waiting)
        };

        let trace_id = self
            .record(
                instance,
                TraceType::Execution,
                ctx,
                &decision,
                governance,
                trace_outcome,
                Some(outcome_summary.clone()),
            )
            .await?;
        self.instances.save(instance).await?;
        Ok(
            OrchestrationResult::new(cycle_outcome, trace_id, Some(outcome_summary))
                .with_followups(followups),
        )
    }

    /// Event side effects applied before evaluation: completions close
    /// pending records, failures close or fail them per the in-edge's
    /// compensation, approvals complete the awaiting human task.
    fn apply_event_effects(
        &self,
        instance: &mut ProcessInstance,
        graph: &ProcessGraph,
        event: &ProcessEvent,
    ) -> Result<(), OrchestratorError> {
        match &event.payload {
            EventPayload::NodeCompleted { node_id, result, .. }
                if instance.has_running_node(node_id) =>
            {
                instance.complete_node_execution(node_id, Some(result.clone()))?;
            }
            EventPayload::Approval {
                node_id,
                approver,
                decision,
                comments,
                ..
            } if instance.has_running_node(node_id) => {
                let output = json!({
                    "decision": decision,
                    "approver": approver,
                    "comments": comments,
                });
                instance.complete_node_execution(node_id, Some(output))?;
            }
            EventPayload::NodeFailed {
                node_id,
                error_message,
                retryable,
                ..
            } if instance.has_running_node(node_id) => {
                let compensation = instance
                    .latest_execution(node_id)
                    .and_then(|e| e.via_edge_id.clone())
                    .and_then(|id| graph.edge(&id).map(|e| e.compensation.clone()))
                    .unwrap_or(Compensation::None);
                let recoverable = *retryable
                    || matches!(
                        compensation,
                        Compensation::Retry { .. }
                            | Compensation::Escalate
                            | Compensation::Compensate { .. }
                    );
                if recoverable {
                    instance.mark_node_failed(node_id, error_message)?;
                } else {
                    instance.fail_node_execution(node_id, error_message)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        instance: &ProcessInstance,
        trace_type: TraceType,
        ctx: &RuntimeContext,
        decision: &NavigationDecision,
        governance: Vec<GovernanceResult>,
        outcome: TraceOutcome,
        detail: Option<String>,
    ) -> Result<Uuid, OrchestratorError> {
        let trace = DecisionTrace::from_decision(
            instance.instance_id,
            trace_type,
            ctx,
            decision,
            governance,
            outcome,
            detail,
        );
        self.tracer.record(trace).await
    }
}
