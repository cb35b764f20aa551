//! Event schema.
//!
//! Events are the only thing that re-triggers evaluation. Every event
//! carries an envelope (id, timestamp, optional correlation id) plus one of
//! the eight payload variants. The core routes on the payload kind and the
//! correlation id and otherwise treats payload bodies as opaque.

use crate::context::EventRecord;
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Escalated,
    Deferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerType {
    Sla,
    Deadline,
    Reminder,
    Escalation,
}

/// The eight event payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    DataChange {
        entity_type: String,
        entity_id: String,
        change_type: ChangeType,
        changed_fields: Vec<String>,
        payload: Value,
    },
    Approval {
        instance_id: Uuid,
        node_id: NodeId,
        approver: String,
        decision: ApprovalDecision,
        comments: Option<String>,
        #[serde(default)]
        metadata: BTreeMap<String, Value>,
    },
    Failure {
        system_name: String,
        failure_type: String,
        error_code: String,
        error_message: String,
        retryable: bool,
        affected_instances: Vec<Uuid>,
    },
    TimerExpired {
        instance_id: Uuid,
        timer_id: String,
        timer_type: TimerType,
        original_deadline: DateTime<Utc>,
        obligation_id: Option<String>,
    },
    PolicyUpdate {
        policy_id: String,
        policy_name: String,
        change_type: String,
        effective_from: DateTime<Utc>,
        affected_node_ids: Vec<NodeId>,
    },
    NodeCompleted {
        instance_id: Uuid,
        node_id: NodeId,
        result: Value,
        duration_ms: u64,
    },
    NodeFailed {
        instance_id: Uuid,
        node_id: NodeId,
        error_type: String,
        error_message: String,
        retry_count: u32,
        retryable: bool,
    },
    DomainEvent {
        domain_event_type: String,
        source_node_id: Option<NodeId>,
        payload: Value,
    },
}

impl EventPayload {
    /// The event-type string used for subscriptions and edge activation.
    /// Domain events use their declared type; everything else uses the
    /// variant name.
    pub fn event_type(&self) -> String {
        match self {
            EventPayload::DataChange { .. } => "data_change".to_string(),
            EventPayload::Approval { .. } => "approval".to_string(),
            EventPayload::Failure { .. } => "failure".to_string(),
            EventPayload::TimerExpired { .. } => "timer_expired".to_string(),
            EventPayload::PolicyUpdate { .. } => "policy_update".to_string(),
            EventPayload::NodeCompleted { .. } => "node_completed".to_string(),
            EventPayload::NodeFailed { .. } => "node_failed".to_string(),
            EventPayload::DomainEvent {
                domain_event_type, ..
            } => domain_event_type.clone(),
        }
    }

    /// The single instance the payload targets, when it targets one.
    pub fn target_instance(&self) -> Option<Uuid> {
        match self {
            EventPayload::Approval { instance_id, .. }
            | EventPayload::TimerExpired { instance_id, .. }
            | EventPayload::NodeCompleted { instance_id, .. }
            | EventPayload::NodeFailed { instance_id, .. } => Some(*instance_id),
            _ => None,
        }
    }
}

/// An event with its envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub payload: EventPayload,
}

impl ProcessEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn event_type(&self) -> String {
        self.payload.event_type()
    }

    /// Project to the form stored in the context's event history.
    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            event_id: self.event_id,
            event_type: self.event_type(),
            received_at: self.timestamp,
            payload: serde_json::to_value(&self.payload).unwrap_or(Value::Null),
        }
    }
}
