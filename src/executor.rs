//! The action-executor port and the registry that resolves handlers.
//!
//! Executors are opaque to the core: they may block on I/O, call other
//! systems, or hand work to humans. The registry keys implementations by
//! `(action type, handler ref)` and bounds every dispatch by the node's
//! configured timeout. Thrown errors never escape a dispatch — they map to
//! a failed result.

use crate::context::RuntimeContext;
use crate::instance::ProcessInstance;
use crate::types::{ActionSpec, ActionType, Node};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Terminal (or pending) status of one action dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Success,
    Failed,
    /// The action completes later via a `NodeCompleted` event correlated by
    /// `{instance_id, node_id}` (human tasks, long-running agent work).
    Pending,
}

/// What an executor reports back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retryable: bool,
}

impl ActionResult {
    pub fn success(output: Value) -> Self {
        Self {
            status: ActionStatus::Success,
            output: Some(output),
            error: None,
            retryable: false,
        }
    }

    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            status: ActionStatus::Failed,
            output: None,
            error: Some(error.into()),
            retryable,
        }
    }

    pub fn pending() -> Self {
        Self {
            status: ActionStatus::Pending,
            output: None,
            error: None,
            retryable: false,
        }
    }
}

/// Runs a node's action. Implementations are chosen by the registry from
/// `node.action.{type, handler_ref}`.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        instance: &ProcessInstance,
        ctx: &RuntimeContext,
    ) -> anyhow::Result<ActionResult>;
}

/// Resolves executors by `(action type, handler ref)`, with an optional
/// fallback for unregistered refs.
pub struct ExecutorRegistry {
    handlers: HashMap<(ActionType, String), Arc<dyn ActionExecutor>>,
    fallback: Option<Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: None,
        }
    }

    pub fn register(
        &mut self,
        action_type: ActionType,
        handler_ref: impl Into<String>,
        executor: Arc<dyn ActionExecutor>,
    ) {
        self.handlers
            .insert((action_type, handler_ref.into()), executor);
    }

    pub fn with_fallback(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn resolve(&self, action: &ActionSpec) -> Option<Arc<dyn ActionExecutor>> {
        self.handlers
            .get(&(action.action_type, action.handler_ref.clone()))
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    /// Dispatch with the node's configured timeout. Resolution failures,
    /// executor errors, and timeouts all come back as failed results; the
    /// caller sets `retryable` from the in-edge's compensation strategy.
    pub async fn dispatch(
        &self,
        node: &Node,
        instance: &ProcessInstance,
        ctx: &RuntimeContext,
    ) -> ActionResult {
        let Some(executor) = self.resolve(&node.action) else {
            return ActionResult::failed(
                format!(
                    "no handler registered for ({:?}, {})",
                    node.action.action_type, node.action.handler_ref
                ),
                false,
            );
        };

        let run = executor.execute(node, instance, ctx);
        let outcome = match node.action.config.timeout_seconds {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
                Ok(result) => result,
                Err(_) => {
                    return ActionResult::failed(
                        format!("action timed out after {secs}s"),
                        true,
                    );
                }
            },
            None => run.await,
        };

        match outcome {
            Ok(result) => result,
            Err(e) => ActionResult::failed(e.to_string(), false),
        }
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
