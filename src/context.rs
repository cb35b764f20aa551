//! Execution and runtime context.
//!
//! [`ExecutionContext`] is the durable, per-instance state: five
//! compartments accumulated over the instance's life. [`RuntimeContext`] is
//! the immutable snapshot assembled at the top of each cycle: the instance
//! context overlaid with tenant configuration and the triggering event.

use crate::error::OrchestratorError;
use crate::instance::ProcessInstance;
use crate::store::ClientConfigSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

// ─── Operational compartment ──────────────────────────────────

/// Coarse system health carried in the operational compartment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    Normal,
    Degraded,
    Maintenance,
    Emergency,
}

impl Default for SystemState {
    fn default() -> Self {
        SystemState::Normal
    }
}

/// A deadline-bearing commitment. Overdue when unsatisfied past its
/// deadline; the periodic sweep turns overdue obligations into
/// `TimerExpired` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    pub id: String,
    pub deadline: DateTime<Utc>,
    pub satisfied: bool,
}

impl Obligation {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.satisfied && now > self.deadline
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationalState {
    #[serde(default)]
    pub system_state: SystemState,
    #[serde(default)]
    pub obligations: Vec<Obligation>,
    /// Policy ids whose advisory failures read as `WAIVED`.
    #[serde(default)]
    pub waived_policies: BTreeSet<String>,
}

// ─── Event history ────────────────────────────────────────────

/// One observed event, as recorded in the context's event history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

// ─── Execution context ────────────────────────────────────────

/// Durable five-compartment context owned by a process instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Tenant configuration.
    #[serde(default)]
    pub client: BTreeMap<String, Value>,
    /// Business facts.
    #[serde(default)]
    pub domain: BTreeMap<String, Value>,
    /// Accumulated per-node outputs, keyed by node id.
    #[serde(default)]
    pub entity_state: BTreeMap<String, Value>,
    #[serde(default)]
    pub operational: OperationalState,
    #[serde(default)]
    pub event_history: Vec<EventRecord>,
}

impl ExecutionContext {
    /// Append an observed event to the history.
    pub fn record_event(&mut self, record: EventRecord) {
        self.event_history.push(record);
    }

    /// Store a node's output in the entity-state compartment.
    pub fn record_node_output(&mut self, node_id: &str, output: Value) {
        self.entity_state.insert(node_id.to_string(), output);
    }

    pub fn has_event(&self, event_type: &str) -> bool {
        self.event_history.iter().any(|e| e.event_type == event_type)
    }
}

// ─── Runtime context ──────────────────────────────────────────

/// Immutable per-cycle snapshot: instance context overlaid with tenant
/// configuration and the triggering event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContext {
    pub client: BTreeMap<String, Value>,
    pub domain: BTreeMap<String, Value>,
    pub entity_state: BTreeMap<String, Value>,
    pub operational: OperationalState,
    pub event_history: Vec<EventRecord>,
    /// The event that triggered this cycle, when event-driven.
    pub current_event: Option<EventRecord>,
    pub assembled_at: DateTime<Utc>,
}

impl RuntimeContext {
    /// Snapshot `ctx` with `tenant_overlay` merged over the client
    /// compartment (overlay wins).
    pub fn assemble(
        ctx: &ExecutionContext,
        tenant_overlay: BTreeMap<String, Value>,
        current_event: Option<EventRecord>,
    ) -> Self {
        let mut client = ctx.client.clone();
        client.extend(tenant_overlay);
        Self {
            client,
            domain: ctx.domain.clone(),
            entity_state: ctx.entity_state.clone(),
            operational: ctx.operational.clone(),
            event_history: ctx.event_history.clone(),
            current_event,
            assembled_at: Utc::now(),
        }
    }

    /// Flatten the snapshot into expression bindings.
    ///
    /// Keys appear both compartment-prefixed (`client.*`, `domain.*`,
    /// `entity.*`, `operational.system_state`) and unprefixed, with the
    /// unprefixed merge ordered client < domain < entity state so node
    /// outputs shadow earlier facts.
    pub fn bindings(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (k, v) in &self.client {
            flatten_into(&format!("client.{k}"), v, &mut out);
        }
        for (k, v) in &self.domain {
            flatten_into(&format!("domain.{k}"), v, &mut out);
        }
        for (k, v) in &self.entity_state {
            flatten_into(&format!("entity.{k}"), v, &mut out);
        }
        if let Ok(state) = serde_json::to_value(self.operational.system_state) {
            out.insert("operational.system_state".to_string(), state);
        }
        for (k, v) in &self.client {
            flatten_into(k, v, &mut out);
        }
        for (k, v) in &self.domain {
            flatten_into(k, v, &mut out);
        }
        for (k, v) in &self.entity_state {
            flatten_into(k, v, &mut out);
        }
        out
    }

    /// Whether `event_type` was observed — in the history or as the
    /// triggering event of this cycle.
    pub fn has_event(&self, event_type: &str) -> bool {
        self.event_history.iter().any(|e| e.event_type == event_type)
            || self
                .current_event
                .as_ref()
                .map(|e| e.event_type == event_type)
                .unwrap_or(false)
    }

    /// Project back to a durable context. Inverse of [`Self::assemble`] on
    /// the compartments both sides define (the tenant overlay stays merged).
    pub fn to_execution_context(&self) -> ExecutionContext {
        ExecutionContext {
            client: self.client.clone(),
            domain: self.domain.clone(),
            entity_state: self.entity_state.clone(),
            operational: self.operational.clone(),
            event_history: self.event_history.clone(),
        }
    }
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(&format!("{prefix}.{k}"), v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

// ─── Assembler ────────────────────────────────────────────────

/// Assembles the per-cycle [`RuntimeContext`] from the instance context and
/// the tenant configuration source.
pub struct ContextAssembler {
    source: Option<Arc<dyn ClientConfigSource>>,
}

impl ContextAssembler {
    pub fn new(source: Arc<dyn ClientConfigSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// Assembler with no tenant configuration source; the client
    /// compartment passes through unchanged.
    pub fn without_client_config() -> Self {
        Self { source: None }
    }

    pub async fn assemble(
        &self,
        instance: &ProcessInstance,
        tenant_id: Option<&str>,
        current_event: Option<EventRecord>,
    ) -> Result<RuntimeContext, OrchestratorError> {
        let overlay = match (tenant_id, &self.source) {
            (Some(tenant), Some(source)) => source.load_for(tenant).await?,
            _ => BTreeMap::new(),
        };
        Ok(RuntimeContext::assemble(
            &instance.context,
            overlay,
            current_event,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_context() -> ExecutionContext {
        let mut ctx = ExecutionContext::default();
        ctx.client.insert("tier".to_string(), json!("gold"));
        ctx.domain
            .insert("review".to_string(), json!({"decision": "REJECTED"}));
        ctx.entity_state
            .insert("AI_ANALYZE".to_string(), json!({"passed": true}));
        ctx
    }

    #[test]
    fn bindings_flatten_nested_objects() {
        let rt = RuntimeContext::assemble(&sample_context(), BTreeMap::new(), None);
        let b = rt.bindings();
        assert_eq!(b.get("review.decision"), Some(&json!("REJECTED")));
        assert_eq!(b.get("domain.review.decision"), Some(&json!("REJECTED")));
        assert_eq!(b.get("AI_ANALYZE.passed"), Some(&json!(true)));
        assert_eq!(b.get("entity.AI_ANALYZE.passed"), Some(&json!(true)));
        assert_eq!(b.get("tier"), Some(&json!("gold")));
        assert_eq!(b.get("operational.system_state"), Some(&json!("NORMAL")));
    }

    #[test]
    fn entity_state_shadows_domain_in_unprefixed_merge() {
        let mut ctx = sample_context();
        ctx.domain.insert("status".to_string(), json!("stale"));
        ctx.entity_state.insert("status".to_string(), json!("fresh"));
        let rt = RuntimeContext::assemble(&ctx, BTreeMap::new(), None);
        let b = rt.bindings();
        assert_eq!(b.get("status"), Some(&json!("fresh")));
        assert_eq!(b.get("domain.status"), Some(&json!("stale")));
    }

    #[test]
    fn tenant_overlay_wins_over_instance_client() {
        let mut overlay = BTreeMap::new();
        overlay.insert("tier".to_string(), json!("platinum"));
        let rt = RuntimeContext::assemble(&sample_context(), overlay, None);
        assert_eq!(rt.client.get("tier"), Some(&json!("platinum")));
    }

    #[test]
    fn current_event_counts_for_has_event() {
        let record = EventRecord {
            event_id: Uuid::now_v7(),
            event_type: "AiAnalysisCompleted".to_string(),
            received_at: Utc::now(),
            payload: Value::Null,
        };
        let rt = RuntimeContext::assemble(&sample_context(), BTreeMap::new(), Some(record));
        assert!(rt.has_event("AiAnalysisCompleted"));
        assert!(!rt.has_event("SomethingElse"));
    }

    #[test]
    fn execution_round_trip_preserves_compartments() {
        let mut ctx = sample_context();
        ctx.operational.obligations.push(Obligation {
            id: "sla-1".to_string(),
            deadline: Utc::now(),
            satisfied: false,
        });
        ctx.record_event(EventRecord {
            event_id: Uuid::now_v7(),
            event_type: "DataChange".to_string(),
            received_at: Utc::now(),
            payload: json!({"field": "email"}),
        });

        let rt = RuntimeContext::assemble(&ctx, BTreeMap::new(), None);
        assert_eq!(rt.to_execution_context(), ctx);
    }

    #[test]
    fn obligation_overdue_requires_unsatisfied_past_deadline() {
        let past = Utc::now() - chrono::Duration::hours(1);
        let mut ob = Obligation {
            id: "deadline-1".to_string(),
            deadline: past,
            satisfied: false,
        };
        assert!(ob.is_overdue(Utc::now()));
        ob.satisfied = true;
        assert!(!ob.is_overdue(Utc::now()));
    }
}
