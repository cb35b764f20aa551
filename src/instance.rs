//! Process instance state.
//!
//! A [`ProcessInstance`] is the single mutable aggregate in the system. It is
//! exclusively mutated by the cycle that holds its lock; everything published
//! outside the lock is a clone.

use crate::context::ExecutionContext;
use crate::error::OrchestratorError;
use crate::graph::ProcessGraph;
use crate::types::{EdgeId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

// ─── Status ───────────────────────────────────────────────────

/// Instance lifecycle. `COMPLETED`, `FAILED`, and `CANCELLED` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

/// Status of one node-execution record. `COMPLETED` and `FAILED` are final
/// for the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One dispatch of a node's action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub execution_id: Uuid,
    pub node_id: NodeId,
    /// The edge that dispatched this execution; `None` for entry nodes and
    /// exception-routed dispatches.
    pub via_edge_id: Option<EdgeId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

// ─── Instance ─────────────────────────────────────────────────

/// A running (or finished) instance of a process graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub graph_id: String,
    pub graph_version: u32,
    pub correlation_id: Option<String>,
    pub status: InstanceStatus,
    pub active_node_ids: BTreeSet<NodeId>,
    pub pending_edge_ids: BTreeSet<EdgeId>,
    pub node_executions: Vec<NodeExecution>,
    pub context: ExecutionContext,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    pub fn new(
        graph: &ProcessGraph,
        correlation_id: Option<String>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            instance_id: Uuid::now_v7(),
            graph_id: graph.id().to_string(),
            graph_version: graph.version(),
            correlation_id,
            status: InstanceStatus::Running,
            active_node_ids: BTreeSet::new(),
            pending_edge_ids: BTreeSet::new(),
            node_executions: Vec::new(),
            context,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    // ── Queries ──

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `node_id` has a `COMPLETED` execution record. Failed records
    /// do not count: a failed node stays eligible for retry or routing.
    pub fn has_executed_node(&self, node_id: &str) -> bool {
        self.node_executions
            .iter()
            .any(|e| e.node_id == node_id && e.status == ExecutionStatus::Completed)
    }

    pub fn has_running_node(&self, node_id: &str) -> bool {
        self.node_executions
            .iter()
            .any(|e| e.node_id == node_id && e.status == ExecutionStatus::Running)
    }

    pub fn completed_node_ids(&self) -> BTreeSet<NodeId> {
        self.node_executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .map(|e| e.node_id.clone())
            .collect()
    }

    /// The most recent execution record for `node_id`.
    pub fn latest_execution(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions.iter().rev().find(|e| e.node_id == node_id)
    }

    /// How many times `node_id` has failed so far.
    pub fn failed_attempts(&self, node_id: &str) -> u32 {
        self.node_executions
            .iter()
            .filter(|e| e.node_id == node_id && e.status == ExecutionStatus::Failed)
            .count() as u32
    }

    // ── Execution records ──

    /// Open a `RUNNING` execution record and mark the node active.
    pub fn start_node_execution(
        &mut self,
        node_id: &str,
        execution_id: Uuid,
        via_edge_id: Option<EdgeId>,
    ) -> Result<(), OrchestratorError> {
        if self.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                action: "start_node_execution",
                expected: "RUNNING",
                actual: format!("{:?}", self.status),
            });
        }
        if self.has_running_node(node_id) {
            return Err(OrchestratorError::InvalidState {
                action: "start_node_execution",
                expected: "no RUNNING record for the node",
                actual: format!("node {node_id} already RUNNING"),
            });
        }
        self.node_executions.push(NodeExecution {
            execution_id,
            node_id: node_id.to_string(),
            via_edge_id,
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            result: None,
            error: None,
        });
        self.active_node_ids.insert(node_id.to_string());
        Ok(())
    }

    /// Close the open record as `COMPLETED` and fold the output into the
    /// entity-state compartment.
    pub fn complete_node_execution(
        &mut self,
        node_id: &str,
        output: Option<Value>,
    ) -> Result<(), OrchestratorError> {
        let record = self.open_record(node_id, "complete_node_execution")?;
        record.status = ExecutionStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.result = output.clone();
        self.active_node_ids.remove(node_id);
        if let Some(output) = output {
            self.context.record_node_output(node_id, output);
        }
        Ok(())
    }

    /// Close the open record as `FAILED` but leave the instance `RUNNING`.
    /// Used for retryable failures and escalation/compensation routing.
    pub fn mark_node_failed(
        &mut self,
        node_id: &str,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        let record = self.open_record(node_id, "mark_node_failed")?;
        record.status = ExecutionStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.error = Some(error.to_string());
        self.active_node_ids.remove(node_id);
        Ok(())
    }

    /// Terminal failure: close the record as `FAILED` and fail the instance.
    pub fn fail_node_execution(
        &mut self,
        node_id: &str,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        self.mark_node_failed(node_id, error)?;
        self.status = InstanceStatus::Failed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn open_record(
        &mut self,
        node_id: &str,
        action: &'static str,
    ) -> Result<&mut NodeExecution, OrchestratorError> {
        self.node_executions
            .iter_mut()
            .rev()
            .find(|e| e.node_id == node_id && e.status == ExecutionStatus::Running)
            .ok_or_else(|| OrchestratorError::InvalidState {
                action,
                expected: "a RUNNING record for the node",
                actual: "none open".to_string(),
            })
    }

    // ── Lifecycle ──

    pub fn complete(&mut self) {
        self.status = InstanceStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = InstanceStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn suspend(&mut self) -> Result<(), OrchestratorError> {
        if self.status != InstanceStatus::Running {
            return Err(OrchestratorError::InvalidState {
                action: "suspend",
                expected: "RUNNING",
                actual: format!("{:?}", self.status),
            });
        }
        self.status = InstanceStatus::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), OrchestratorError> {
        if self.status != InstanceStatus::Suspended {
            return Err(OrchestratorError::InvalidState {
                action: "resume",
                expected: "SUSPENDED",
                actual: format!("{:?}", self.status),
            });
        }
        self.status = InstanceStatus::Running;
        Ok(())
    }
}
