//! The process-wide orchestrator: bounded event queue, single-consumer
//! event loop, instance routing, lifecycle operations, and periodic
//! obligation sweeps.
//!
//! Per-instance serialization is mandatory: an instance-keyed mutex map
//! guarantees at most one cycle in flight per instance, and the single
//! consumer preserves queue-arrival order for events targeting the same
//! instance. Repository failures inside the loop are logged and the cycle
//! is abandoned for that instance; the event is not redelivered.

use crate::config::{OrchestratorConfig, QueueFullPolicy};
use crate::context::ExecutionContext;
use crate::error::OrchestratorError;
use crate::events::{EventPayload, ProcessEvent, TimerType};
use crate::graph::ProcessGraph;
use crate::instance::{InstanceStatus, ProcessInstance};
use crate::orchestrator::{CycleOutcome, InstanceOrchestrator, OrchestrationResult};
use crate::store::{
    DecisionTraceRepository, ProcessGraphRepository, ProcessInstanceRepository,
};
use crate::tracer::{DecisionTrace, DecisionTracer, TraceOutcome};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ─── Status cache ─────────────────────────────────────────────

#[derive(Clone, Debug)]
struct CachedStatus {
    outcome: CycleOutcome,
    trace_id: Option<Uuid>,
}

/// What `get_status` returns.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub instance: ProcessInstance,
    pub last_outcome: Option<CycleOutcome>,
    pub last_trace_id: Option<Uuid>,
    pub is_active: bool,
}

// ─── Orchestrator ─────────────────────────────────────────────

/// Owns the queue, the status cache, and the per-instance locks. All
/// process-wide state lives here; there are no implicit singletons.
pub struct ProcessOrchestrator {
    config: OrchestratorConfig,
    graphs: Arc<dyn ProcessGraphRepository>,
    instances: Arc<dyn ProcessInstanceRepository>,
    traces: Option<Arc<dyn DecisionTraceRepository>>,
    engine: Arc<InstanceOrchestrator>,
    tracer: Arc<DecisionTracer>,
    tx: mpsc::Sender<ProcessEvent>,
    rx: Mutex<Option<mpsc::Receiver<ProcessEvent>>>,
    statuses: RwLock<HashMap<Uuid, CachedStatus>>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProcessOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        graphs: Arc<dyn ProcessGraphRepository>,
        instances: Arc<dyn ProcessInstanceRepository>,
        engine: Arc<InstanceOrchestrator>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let tracer = engine.tracer().clone();
        Self {
            config,
            graphs,
            instances,
            traces: None,
            engine,
            tracer,
            tx,
            rx: Mutex::new(Some(rx)),
            statuses: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Trace repository used by `get_status` on cache misses.
    pub fn with_trace_repository(mut self, traces: Arc<dyn DecisionTraceRepository>) -> Self {
        self.traces = Some(traces);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Lifecycle ──

    /// Create and persist an instance, run its entry cycle, and cache the
    /// outcome. The graph is persisted too when the repository does not
    /// know it yet.
    pub async fn start(
        &self,
        graph: &ProcessGraph,
        initial_context: ExecutionContext,
        correlation_id: Option<String>,
        tenant_id: Option<&str>,
    ) -> Result<Uuid, OrchestratorError> {
        if !self.config.enabled {
            return Err(OrchestratorError::Disabled);
        }
        if self
            .graphs
            .find_by_id_and_version(graph.id(), graph.version())
            .await?
            .is_none()
        {
            self.graphs.save(graph).await?;
        }

        let mut instance = ProcessInstance::new(graph, correlation_id, initial_context);
        if let Some(tenant) = tenant_id {
            instance
                .context
                .client
                .insert("tenant_id".to_string(), json!(tenant));
        }
        self.instances.save(&instance).await?;
        let instance_id = instance.instance_id;

        let followups = {
            let lock = self.instance_lock(instance_id).await;
            let _guard = lock.lock().await;
            let result = self
                .engine
                .orchestrate_entry(&mut instance, graph, tenant_id)
                .await?;
            self.cache_result(instance_id, &result).await;
            result.followup_events
        };
        self.enqueue_followups(followups).await;
        info!(instance_id = %instance_id, graph_id = %graph.id(), "process instance started");
        Ok(instance_id)
    }

    /// Offer an event to the bounded queue, per the configured full-queue
    /// policy.
    pub async fn signal(&self, event: ProcessEvent) -> Result<(), OrchestratorError> {
        if !self.config.enabled {
            return Err(OrchestratorError::Disabled);
        }
        match &self.config.queue_full_policy {
            QueueFullPolicy::DropNewest => match self.tx.try_send(event) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!(event_id = %event.event_id, event_type = %event.event_type(), "event queue full; dropping event");
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(event)) => {
                    Err(OrchestratorError::QueueFull(event.event_id))
                }
            },
            QueueFullPolicy::Block { timeout_ms } => {
                let timeout = Duration::from_millis(*timeout_ms);
                match self.tx.send_timeout(event, timeout).await {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::SendTimeoutError::Timeout(event))
                    | Err(mpsc::error::SendTimeoutError::Closed(event)) => {
                        Err(OrchestratorError::QueueFull(event.event_id))
                    }
                }
            }
        }
    }

    pub async fn suspend(&self, instance_id: Uuid) -> Result<(), OrchestratorError> {
        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;
        let mut instance = self.load_instance(instance_id).await?;
        instance.suspend()?;
        self.instances.save(&instance).await?;
        info!(%instance_id, "instance suspended");
        Ok(())
    }

    /// Restore a suspended instance to `RUNNING` and run one cycle.
    pub async fn resume(&self, instance_id: Uuid) -> Result<(), OrchestratorError> {
        let followups = {
            let lock = self.instance_lock(instance_id).await;
            let _guard = lock.lock().await;
            let mut instance = self.load_instance(instance_id).await?;
            instance.resume()?;
            self.instances.save(&instance).await?;

            let graph = self.load_graph(&instance).await?;
            let tenant = tenant_of(&instance);
            let result = self
                .engine
                .orchestrate(&mut instance, &graph, tenant.as_deref())
                .await?;
            self.cache_result(instance_id, &result).await;
            result.followup_events
        };
        self.enqueue_followups(followups).await;
        info!(%instance_id, "instance resumed");
        Ok(())
    }

    pub async fn cancel(&self, instance_id: Uuid) -> Result<(), OrchestratorError> {
        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;
        let mut instance = self.load_instance(instance_id).await?;
        if instance.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                action: "cancel",
                expected: "a non-terminal instance",
                actual: format!("{:?}", instance.status),
            });
        }
        instance.cancel();
        self.instances.save(&instance).await?;
        info!(%instance_id, "instance cancelled");
        Ok(())
    }

    /// Cached status, falling back to the repositories on a cache miss.
    pub async fn get_status(&self, instance_id: Uuid) -> Result<StatusSnapshot, OrchestratorError> {
        let instance = self.load_instance(instance_id).await?;
        let cached = self.statuses.read().await.get(&instance_id).cloned();
        let (last_outcome, last_trace_id) = match cached {
            Some(status) => (Some(status.outcome), status.trace_id),
            None => {
                let trace_id = match &self.traces {
                    Some(repo) => repo
                        .find_latest_by_instance_id(instance_id)
                        .await?
                        .map(|t| t.trace_id),
                    None => None,
                };
                (None, trace_id)
            }
        };
        let is_active = instance.status == InstanceStatus::Running;
        Ok(StatusSnapshot {
            instance,
            last_outcome,
            last_trace_id,
            is_active,
        })
    }

    // ── Event loop ──

    /// Drain the queue until shutdown. Call once; typically from a spawned
    /// task holding an `Arc<Self>`.
    pub async fn run_event_loop(&self) -> Result<(), OrchestratorError> {
        let mut rx = self.rx.lock().await.take().ok_or(OrchestratorError::InvalidState {
            action: "run_event_loop",
            expected: "the loop not already running",
            actual: "receiver already taken".to_string(),
        })?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_millis(self.config.evaluation_interval_ms.max(1));
        info!("event loop started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            error!(?e, event_id = %event.event_id, "event handling failed; cycle abandoned");
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.periodic_evaluation().await {
                        error!(?e, "periodic evaluation failed");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
        info!("event loop stopped");
        Ok(())
    }

    /// Signal the loop to stop after the in-flight event.
    pub fn stop_event_loop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the loop and wait up to `shutdown_grace_ms` for it to drain,
    /// then force termination.
    pub async fn shutdown(&self, mut handle: tokio::task::JoinHandle<Result<(), OrchestratorError>>) {
        self.stop_event_loop();
        let grace = Duration::from_millis(self.config.shutdown_grace_ms.max(1));
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("shutdown grace elapsed; forcing event loop termination");
            handle.abort();
        }
    }

    /// Route one event to every affected instance and run their cycles.
    pub async fn handle_event(&self, event: &ProcessEvent) -> Result<(), OrchestratorError> {
        let affected = self.find_affected_instances(event).await?;
        if affected.is_empty() {
            debug!(event_id = %event.event_id, event_type = %event.event_type(), "no affected instances");
        }
        for instance_id in affected {
            if let Err(e) = self.run_instance_cycle(instance_id, event).await {
                error!(?e, %instance_id, event_id = %event.event_id, "cycle failed; abandoned for this instance");
            }
        }
        Ok(())
    }

    /// Event-to-instance routing.
    async fn find_affected_instances(
        &self,
        event: &ProcessEvent,
    ) -> Result<Vec<Uuid>, OrchestratorError> {
        // Targeted events: the single instance in the payload, if running.
        if let Some(instance_id) = event.payload.target_instance() {
            return match self.instances.find_by_id(instance_id).await? {
                Some(instance) if instance.status == InstanceStatus::Running => {
                    Ok(vec![instance_id])
                }
                Some(instance) => {
                    self.absorb(instance_id, &instance.status, event).await?;
                    Ok(vec![])
                }
                None => {
                    warn!(%instance_id, event_id = %event.event_id, "event targets unknown instance");
                    Ok(vec![])
                }
            };
        }

        let mut affected = self.route_by_correlation(event).await?;

        // Failure events also name the instances they affect.
        if let EventPayload::Failure {
            affected_instances, ..
        } = &event.payload
        {
            for id in affected_instances {
                if affected.contains(id) {
                    continue;
                }
                if let Some(instance) = self.instances.find_by_id(*id).await? {
                    if instance.status == InstanceStatus::Running {
                        affected.push(*id);
                    }
                }
            }
        }
        Ok(affected)
    }

    /// Correlation routing: instance id first, then correlation lookup,
    /// then broadcast to every running instance.
    async fn route_by_correlation(
        &self,
        event: &ProcessEvent,
    ) -> Result<Vec<Uuid>, OrchestratorError> {
        if let Some(correlation) = &event.correlation_id {
            if let Ok(as_id) = Uuid::parse_str(correlation) {
                if let Some(instance) = self.instances.find_by_id(as_id).await? {
                    if instance.status == InstanceStatus::Running {
                        return Ok(vec![as_id]);
                    }
                }
            }
            let matched: Vec<Uuid> = self
                .instances
                .find_by_correlation_id(correlation)
                .await?
                .into_iter()
                .filter(|i| i.status == InstanceStatus::Running)
                .map(|i| i.instance_id)
                .collect();
            if !matched.is_empty() {
                return Ok(matched);
            }
        }
        Ok(self
            .instances
            .find_running()
            .await?
            .into_iter()
            .map(|i| i.instance_id)
            .collect())
    }

    /// One serialized cycle for one instance.
    async fn run_instance_cycle(
        &self,
        instance_id: Uuid,
        event: &ProcessEvent,
    ) -> Result<(), OrchestratorError> {
        let followups = {
            let lock = self.instance_lock(instance_id).await;
            let _guard = lock.lock().await;
            let Some(mut instance) = self.instances.find_by_id(instance_id).await? else {
                warn!(%instance_id, "instance vanished before cycle");
                return Ok(());
            };
            if instance.status != InstanceStatus::Running {
                self.absorb(instance_id, &instance.status, event).await?;
                return Ok(());
            }

            let graph = self.load_graph(&instance).await?;
            let tenant = tenant_of(&instance);
            let result = self
                .engine
                .reevaluate_after_event(&mut instance, &graph, tenant.as_deref(), event)
                .await?;
            self.cache_result(instance_id, &result).await;
            result.followup_events
        };
        self.enqueue_followups(followups).await;
        Ok(())
    }

    /// Scan running instances for overdue obligations and synthesize
    /// `TimerExpired` events; enforce trace retention while at it.
    async fn periodic_evaluation(&self) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let pruned = self
            .tracer
            .delete_older_than(self.tracer.retention_cutoff(now))
            .await?;
        if pruned > 0 {
            debug!(pruned, "trace retention pruned old traces");
        }

        let running = self.instances.find_running().await?;
        for instance in running {
            let overdue: Vec<_> = instance
                .context
                .operational
                .obligations
                .iter()
                .filter(|o| o.is_overdue(now))
                .cloned()
                .collect();
            for obligation in overdue {
                debug!(
                    instance_id = %instance.instance_id,
                    obligation = %obligation.id,
                    "obligation overdue; synthesizing timer event"
                );
                let event = ProcessEvent::new(EventPayload::TimerExpired {
                    instance_id: instance.instance_id,
                    timer_id: obligation.id.clone(),
                    timer_type: TimerType::Deadline,
                    original_deadline: obligation.deadline,
                    obligation_id: Some(obligation.id.clone()),
                });
                self.handle_event(&event).await?;
            }
        }
        Ok(())
    }

    // ── Internals ──

    /// Absorb an event for a non-running instance: a `WAIT` trace records
    /// the drop, nothing executes.
    async fn absorb(
        &self,
        instance_id: Uuid,
        status: &InstanceStatus,
        event: &ProcessEvent,
    ) -> Result<(), OrchestratorError> {
        debug!(%instance_id, ?status, event_id = %event.event_id, "event dropped for non-running instance");
        let trace = DecisionTrace::absorbed(
            instance_id,
            TraceOutcome::Waiting,
            format!(
                "event {} ({}) dropped: instance is {:?}",
                event.event_id,
                event.event_type(),
                status
            ),
        );
        self.tracer.record(trace).await?;
        Ok(())
    }

    async fn load_instance(&self, instance_id: Uuid) -> Result<ProcessInstance, OrchestratorError> {
        self.instances
            .find_by_id(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound(instance_id))
    }

    async fn load_graph(&self, instance: &ProcessInstance) -> Result<ProcessGraph, OrchestratorError> {
        self.graphs
            .find_by_id_and_version(&instance.graph_id, instance.graph_version)
            .await?
            .ok_or_else(|| OrchestratorError::GraphNotFound {
                id: instance.graph_id.clone(),
                version: Some(instance.graph_version),
            })
    }

    async fn instance_lock(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cache_result(&self, instance_id: Uuid, result: &OrchestrationResult) {
        let mut statuses = self.statuses.write().await;
        statuses.insert(
            instance_id,
            CachedStatus {
                outcome: result.outcome,
                trace_id: result.trace_id,
            },
        );
    }

    async fn enqueue_followups(&self, events: Vec<ProcessEvent>) {
        for event in events {
            if let Err(e) = self.signal(event).await {
                warn!(?e, "failed to enqueue follow-up event");
            }
        }
    }
}

fn tenant_of(instance: &ProcessInstance) -> Option<String> {
    instance
        .context
        .client
        .get("tenant_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}
