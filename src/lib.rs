//! procflow — a policy-enforcing process orchestrator.
//!
//! The runtime navigates a declarative process graph as a decision engine.
//! Each cycle assembles a runtime context, computes the eligible next
//! actions, deterministically selects what to execute, enforces governance
//! (idempotency, authorization, runtime policy gate), dispatches through a
//! pluggable executor, and records an immutable decision trace. Events —
//! data changes, approvals, timers, node completions, domain events —
//! re-trigger the cycle through the process-wide event loop.
//!
//! The crate is the core only: persistence backends, concrete action
//! handlers, the production guard-expression language, and any HTTP/RPC
//! surface plug in behind the ports in [`store`], [`executor`], and
//! [`expression`].

pub mod config;
pub mod context;
pub mod decider;
pub mod error;
pub mod eval;
pub mod events;
pub mod executor;
pub mod expression;
pub mod governor;
pub mod graph;
pub mod instance;
pub mod orchestrator;
pub mod runtime;
pub mod store;
pub mod store_memory;
pub mod tracer;
pub mod types;

pub use config::{GovernanceConfig, OrchestratorConfig, QueueFullPolicy, TracingConfig};
pub use context::{
    ContextAssembler, ExecutionContext, Obligation, OperationalState, RuntimeContext, SystemState,
};
pub use decider::{
    DecisionType, DependencyConstraints, NavigationDecider, NavigationDecision, SelectionCriteria,
};
pub use error::{ExpressionError, OrchestratorError};
pub use eval::{
    CandidateAction, EdgeEvaluation, EdgeEvaluator, EligibilityEvaluator, EligibleSpace,
    NodeEvaluation, NodeEvaluator,
};
pub use events::{EventPayload, ProcessEvent};
pub use executor::{ActionExecutor, ActionResult, ActionStatus, ExecutorRegistry};
pub use expression::{ExpressionEvaluator, SimpleExpressionEvaluator};
pub use governor::{ExecutionGovernor, GovernanceResult, RuntimePolicy};
pub use graph::{GraphDefinition, GraphStatus, ProcessGraph};
pub use instance::{InstanceStatus, NodeExecution, ProcessInstance};
pub use orchestrator::{CycleOutcome, InstanceOrchestrator, OrchestrationResult};
pub use runtime::{ProcessOrchestrator, StatusSnapshot};
pub use tracer::{DecisionTrace, DecisionTracer, TraceOutcome, TraceType};
