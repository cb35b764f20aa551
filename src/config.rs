//! Orchestrator configuration.
//!
//! Explicit structs with documented defaults; every field is individually
//! defaultable so partial YAML/JSON configs deserialize cleanly.

use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Master switch. When false, `start`/`signal` refuse work.
    pub enabled: bool,
    /// Bounded event queue capacity.
    pub event_queue_capacity: usize,
    /// Periodic sweep cadence (queue poll timeout), in milliseconds.
    pub evaluation_interval_ms: u64,
    /// What to do when the event queue is full.
    pub queue_full_policy: QueueFullPolicy,
    /// Pre-execution governance switches.
    pub governance: GovernanceConfig,
    /// Decision tracing switches.
    pub tracing: TracingConfig,
    /// Cap on concurrent dispatch per cycle. `None` = unlimited.
    pub max_parallel_per_step: Option<usize>,
    /// How long shutdown waits for in-flight cycles, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_queue_capacity: 10_000,
            evaluation_interval_ms: 5_000,
            queue_full_policy: QueueFullPolicy::default(),
            governance: GovernanceConfig::default(),
            tracing: TracingConfig::default(),
            max_parallel_per_step: None,
            shutdown_grace_ms: 30_000,
        }
    }
}

/// Behavior when `signal` finds the queue full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Log and drop the incoming event.
    DropNewest,
    /// Block the caller up to `timeout_ms`, then reject.
    Block { timeout_ms: u64 },
}

impl Default for QueueFullPolicy {
    fn default() -> Self {
        QueueFullPolicy::DropNewest
    }
}

/// Switches for the three governance checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub idempotency_enabled: bool,
    pub authorization_enabled: bool,
    pub policy_gate_enabled: bool,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            idempotency_enabled: true,
            authorization_enabled: true,
            policy_gate_enabled: true,
        }
    }
}

/// Switches for decision tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Emit log records per trace.
    pub enabled: bool,
    /// Persist traces to the trace repository.
    pub persist_traces: bool,
    /// Retention window for persisted traces, in days.
    pub trace_retention_days: u32,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_traces: true,
            trace_retention_days: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.event_queue_capacity, 10_000);
        assert_eq!(cfg.evaluation_interval_ms, 5_000);
        assert_eq!(cfg.queue_full_policy, QueueFullPolicy::DropNewest);
        assert!(cfg.governance.idempotency_enabled);
        assert!(cfg.governance.authorization_enabled);
        assert!(cfg.governance.policy_gate_enabled);
        assert!(cfg.tracing.enabled);
        assert!(cfg.tracing.persist_traces);
        assert_eq!(cfg.tracing.trace_retention_days, 90);
        assert_eq!(cfg.max_parallel_per_step, None);
        assert_eq!(cfg.shutdown_grace_ms, 30_000);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: OrchestratorConfig = serde_yaml::from_str(
            r#"
            event_queue_capacity: 64
            governance:
              authorization_enabled: false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.event_queue_capacity, 64);
        assert!(!cfg.governance.authorization_enabled);
        assert!(cfg.governance.idempotency_enabled);
        assert_eq!(cfg.evaluation_interval_ms, 5_000);
    }

    #[test]
    fn block_policy_round_trips() {
        let policy = QueueFullPolicy::Block { timeout_ms: 250 };
        let json = serde_json::to_string(&policy).unwrap();
        let back: QueueFullPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, back);
    }
}
