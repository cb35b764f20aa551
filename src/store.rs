//! Persistence ports.
//!
//! The orchestrator operates exclusively through these traits, keeping
//! backends pluggable (in-memory for POC/testing, a database in
//! production). Implementations must be safe for concurrent use: upserts
//! keyed by id are atomic, the trace store is append-only, and
//! `put_if_absent` on the idempotency store is atomic.

use crate::graph::{GraphStatus, ProcessGraph};
use crate::instance::{InstanceStatus, ProcessInstance};
use crate::tracer::{DecisionTrace, TraceType};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Storage for process graphs, keyed by `(id, version)`.
///
/// Backends persist `graph.definition()` plus the status and rebuild with
/// [`ProcessGraph::from_definition`].
#[async_trait]
pub trait ProcessGraphRepository: Send + Sync {
    async fn find_latest_version(&self, id: &str) -> Result<Option<ProcessGraph>>;
    async fn find_by_id_and_version(&self, id: &str, version: u32) -> Result<Option<ProcessGraph>>;
    async fn find_by_status(&self, status: GraphStatus) -> Result<Vec<ProcessGraph>>;
    async fn save(&self, graph: &ProcessGraph) -> Result<()>;
    async fn delete_by_id(&self, id: &str) -> Result<()>;
}

/// Storage for process instances.
#[async_trait]
pub trait ProcessInstanceRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<ProcessInstance>>;
    async fn find_by_status(&self, status: InstanceStatus) -> Result<Vec<ProcessInstance>>;
    async fn find_running(&self) -> Result<Vec<ProcessInstance>>;
    async fn save(&self, instance: &ProcessInstance) -> Result<()>;
}

/// Append-only storage for decision traces, indexed by
/// `(instance_id, timestamp)` and `(instance_id, type)`.
#[async_trait]
pub trait DecisionTraceRepository: Send + Sync {
    async fn save(&self, trace: &DecisionTrace) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<DecisionTrace>>;
    async fn find_by_instance_id(&self, instance_id: Uuid) -> Result<Vec<DecisionTrace>>;
    async fn find_by_instance_id_and_time_range(
        &self,
        instance_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DecisionTrace>>;
    async fn find_latest_by_instance_id(&self, instance_id: Uuid) -> Result<Option<DecisionTrace>>;
    async fn find_by_instance_id_and_type(
        &self,
        instance_id: Uuid,
        trace_type: TraceType,
    ) -> Result<Vec<DecisionTrace>>;
    async fn count_by_instance_id(&self, instance_id: Uuid) -> Result<u64>;
    /// Delete traces older than `cutoff`; returns how many went.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Execution dedupe store. `put_if_absent` must be atomic.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert `key → execution_id` unless present; returns the previously
    /// recorded execution id when there was one.
    async fn put_if_absent(&self, key: &str, execution_id: Uuid) -> Result<Option<Uuid>>;
    async fn get(&self, key: &str) -> Result<Option<Uuid>>;
}

/// Tenant configuration source for the client compartment.
#[async_trait]
pub trait ClientConfigSource: Send + Sync {
    async fn load_for(&self, tenant_id: &str) -> Result<BTreeMap<String, Value>>;
}
