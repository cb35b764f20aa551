//! In-memory implementations of the persistence ports, for POC and
//! testing. Each store keeps its state behind one `RwLock` and clones on
//! the way out, so readers never observe a torn value.

use crate::graph::{GraphStatus, ProcessGraph};
use crate::instance::{InstanceStatus, ProcessInstance};
use crate::store::{
    ClientConfigSource, DecisionTraceRepository, IdempotencyStore, ProcessGraphRepository,
    ProcessInstanceRepository,
};
use crate::tracer::{DecisionTrace, TraceType};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

// ─── Graphs ───────────────────────────────────────────────────

/// In-memory `ProcessGraphRepository`, keyed by `(id, version)`.
pub struct InMemoryGraphRepository {
    inner: RwLock<HashMap<(String, u32), ProcessGraph>>,
}

impl InMemoryGraphRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryGraphRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessGraphRepository for InMemoryGraphRepository {
    async fn find_latest_version(&self, id: &str) -> Result<Option<ProcessGraph>> {
        let r = self.inner.read().await;
        Ok(r.values()
            .filter(|g| g.id() == id)
            .max_by_key(|g| g.version())
            .cloned())
    }

    async fn find_by_id_and_version(&self, id: &str, version: u32) -> Result<Option<ProcessGraph>> {
        let r = self.inner.read().await;
        Ok(r.get(&(id.to_string(), version)).cloned())
    }

    async fn find_by_status(&self, status: GraphStatus) -> Result<Vec<ProcessGraph>> {
        let r = self.inner.read().await;
        Ok(r.values().filter(|g| g.status() == status).cloned().collect())
    }

    async fn save(&self, graph: &ProcessGraph) -> Result<()> {
        let mut w = self.inner.write().await;
        w.insert((graph.id().to_string(), graph.version()), graph.clone());
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.retain(|(gid, _), _| gid != id);
        Ok(())
    }
}

// ─── Instances ────────────────────────────────────────────────

/// In-memory `ProcessInstanceRepository`.
pub struct InMemoryInstanceRepository {
    inner: RwLock<HashMap<Uuid, ProcessInstance>>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryInstanceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessInstanceRepository for InMemoryInstanceRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.get(&id).cloned())
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.values()
            .filter(|i| i.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect())
    }

    async fn find_by_status(&self, status: InstanceStatus) -> Result<Vec<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.values().filter(|i| i.status == status).cloned().collect())
    }

    async fn find_running(&self) -> Result<Vec<ProcessInstance>> {
        self.find_by_status(InstanceStatus::Running).await
    }

    async fn save(&self, instance: &ProcessInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        w.insert(instance.instance_id, instance.clone());
        Ok(())
    }
}

// ─── Traces ───────────────────────────────────────────────────

/// In-memory append-only `DecisionTraceRepository`.
pub struct InMemoryTraceRepository {
    inner: RwLock<Vec<DecisionTrace>>,
}

impl InMemoryTraceRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryTraceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionTraceRepository for InMemoryTraceRepository {
    async fn save(&self, trace: &DecisionTrace) -> Result<()> {
        let mut w = self.inner.write().await;
        w.push(trace.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<DecisionTrace>> {
        let r = self.inner.read().await;
        Ok(r.iter().find(|t| t.trace_id == id).cloned())
    }

    async fn find_by_instance_id(&self, instance_id: Uuid) -> Result<Vec<DecisionTrace>> {
        let r = self.inner.read().await;
        Ok(r.iter()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn find_by_instance_id_and_time_range(
        &self,
        instance_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DecisionTrace>> {
        let r = self.inner.read().await;
        Ok(r.iter()
            .filter(|t| t.instance_id == instance_id && t.timestamp >= from && t.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn find_latest_by_instance_id(&self, instance_id: Uuid) -> Result<Option<DecisionTrace>> {
        let r = self.inner.read().await;
        Ok(r.iter()
            .filter(|t| t.instance_id == instance_id)
            .max_by_key(|t| t.timestamp)
            .cloned())
    }

    async fn find_by_instance_id_and_type(
        &self,
        instance_id: Uuid,
        trace_type: TraceType,
    ) -> Result<Vec<DecisionTrace>> {
        let r = self.inner.read().await;
        Ok(r.iter()
            .filter(|t| t.instance_id == instance_id && t.trace_type == trace_type)
            .cloned()
            .collect())
    }

    async fn count_by_instance_id(&self, instance_id: Uuid) -> Result<u64> {
        let r = self.inner.read().await;
        Ok(r.iter().filter(|t| t.instance_id == instance_id).count() as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut w = self.inner.write().await;
        let before = w.len();
        w.retain(|t| t.timestamp >= cutoff);
        Ok((before - w.len()) as u64)
    }
}

// ─── Idempotency ──────────────────────────────────────────────

/// In-memory `IdempotencyStore`. `put_if_absent` is atomic under the write
/// lock.
pub struct InMemoryIdempotencyStore {
    inner: RwLock<HashMap<String, Uuid>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn put_if_absent(&self, key: &str, execution_id: Uuid) -> Result<Option<Uuid>> {
        let mut w = self.inner.write().await;
        match w.get(key) {
            Some(existing) => Ok(Some(*existing)),
            None => {
                w.insert(key.to_string(), execution_id);
                Ok(None)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Uuid>> {
        let r = self.inner.read().await;
        Ok(r.get(key).copied())
    }
}

// ─── Client config ────────────────────────────────────────────

/// Static tenant configuration for fixtures: a map per tenant id, empty for
/// unknown tenants.
pub struct StaticClientConfig {
    tenants: HashMap<String, BTreeMap<String, Value>>,
}

impl StaticClientConfig {
    pub fn new() -> Self {
        Self {
            tenants: HashMap::new(),
        }
    }

    pub fn with_tenant(
        mut self,
        tenant_id: impl Into<String>,
        config: BTreeMap<String, Value>,
    ) -> Self {
        self.tenants.insert(tenant_id.into(), config);
        self
    }
}

impl Default for StaticClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientConfigSource for StaticClientConfig {
    async fn load_for(&self, tenant_id: &str) -> Result<BTreeMap<String, Value>> {
        Ok(self.tenants.get(tenant_id).cloned().unwrap_or_default())
    }
}
