//! Error taxonomy for the orchestrator.
//!
//! Evaluation outcomes are never errors — node/edge evaluators and the
//! decider return result sums carrying reasons. These types cover the
//! remaining failure surface: lookups, lifecycle violations, executor
//! faults, and repository faults.

use thiserror::Error;
use uuid::Uuid;

/// Guard-expression evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("parse error in expression `{expression}`: {message}")]
    Parse { expression: String, message: String },

    #[error("type error in expression `{expression}`: {message}")]
    Type { expression: String, message: String },

    #[error("missing binding `{binding}` in expression `{expression}`")]
    MissingBinding { expression: String, binding: String },
}

/// Top-level orchestrator error.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("process graph not found: {id}")]
    GraphNotFound { id: String, version: Option<u32> },

    #[error("process instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("node not found in graph: {0}")]
    NodeNotFound(String),

    #[error("invalid lifecycle state: {action} requires {expected}, instance is {actual}")]
    InvalidState {
        action: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("precondition failed on node {node_id}: {reason}")]
    PreconditionFailed { node_id: String, reason: String },

    #[error("guard failed on edge {edge_id}: {reason}")]
    GuardFailed { edge_id: String, reason: String },

    #[error("policy {policy_id} blocked execution: {reason}")]
    PolicyBlocked { policy_id: String, reason: String },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("action failed on node {node_id}: {message}")]
    ActionFailed {
        node_id: String,
        message: String,
        retryable: bool,
    },

    #[error("action on node {node_id} timed out after {timeout_seconds}s")]
    Timeout {
        node_id: String,
        timeout_seconds: u64,
    },

    #[error("rule {rule_id} evaluation failed: {reason}")]
    RuleEvaluationFailed { rule_id: String, reason: String },

    #[error("compensation failed for node {node_id}: {reason}")]
    CompensationFailed { node_id: String, reason: String },

    #[error("event queue full, event {0} rejected")]
    QueueFull(Uuid),

    #[error("orchestrator is disabled by configuration")]
    Disabled,

    #[error(transparent)]
    Repository(#[from] anyhow::Error),

    #[error("unknown orchestrator error: {0}")]
    Unknown(String),
}

impl OrchestratorError {
    /// Whether the failure is worth retrying. `UNKNOWN` is always final.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::ActionFailed { retryable, .. } => *retryable,
            OrchestratorError::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_error_display_names_binding() {
        let err = ExpressionError::MissingBinding {
            expression: "review.decision = \"REJECTED\"".to_string(),
            binding: "review.decision".to_string(),
        };
        assert!(err.to_string().contains("review.decision"));
    }

    #[test]
    fn unknown_is_never_retryable() {
        assert!(!OrchestratorError::Unknown("boom".into()).is_retryable());
        assert!(OrchestratorError::ActionFailed {
            node_id: "A".into(),
            message: "transient".into(),
            retryable: true
        }
        .is_retryable());
    }
}
