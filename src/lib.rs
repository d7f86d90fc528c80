//! # Conductor Core
//!
//! A workflow orchestration engine that executes published step-graph
//! definitions against external side-effecting handlers with explicit,
//! auditable semantics: at-most-once handler invocation per attempt,
//! deterministic error classification, a declarative retry matrix,
//! append-only attempt history, lease-based worker exclusion, and
//! compensation routing for failures that are unsafe to repeat.
//!
//! ## Key Features
//!
//! - **Immutable definitions**: publish is validated and idempotent on
//!   content; executions pin the exact version they were created against
//! - **Idempotent creation**: one execution per `(tenant, caller key)`,
//!   whatever the concurrency or redelivery pattern
//! - **Deterministic failure handling**: six error classes, fail-closed
//!   classification, per-step retry policies with fixed, exponential, and
//!   decorrelated-jitter backoff
//! - **Safety classes**: guarded retries consult the handler's completion
//!   pre-check; `NOT_SAFE_TO_RETRY` failures route to human-approved
//!   compensation instead of looping
//! - **Observability**: every lifecycle transition is published as a typed
//!   event correlated from execution down to the handler's idempotency key
//!
//! The engine is storage-agnostic: all cross-worker coordination state sits
//! behind the [`store::ExecutionStore`] trait, with a faithful in-memory
//! implementation bundled for embedding and tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use conductor_core::coordinator::{CreateExecutionRequest, ExecutionCoordinator};
//! use conductor_core::definition::{DefinitionDraft, DefinitionStore, StepDefinition};
//! use conductor_core::registry::HandlerRegistry;
//!
//! # async fn example(handler: Arc<dyn conductor_core::registry::StepHandler>) -> conductor_core::Result<()> {
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register("invoices", handler);
//!
//! let definitions = Arc::new(DefinitionStore::new(registry));
//! let (definition_id, version) = definitions.publish(DefinitionDraft::new(
//!     "billing",
//!     vec![StepDefinition::task("issue_invoice", "invoices")],
//! ))?;
//!
//! let coordinator = ExecutionCoordinator::in_memory(definitions);
//! let execution_id = coordinator
//!     .create_execution(CreateExecutionRequest {
//!         definition_id,
//!         definition_version: version,
//!         tenant: "acme".into(),
//!         input: serde_json::json!({ "order": 42 }),
//!         idempotency_key: "order-42".into(),
//!     })
//!     .await?;
//! let view = coordinator.run_to_completion(execution_id, "worker-1").await?;
//! println!("{}", view.execution.status);
//! # Ok(())
//! # }
//! ```

pub mod authz;
pub mod classifier;
pub mod compensation;
pub mod config;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod events;
pub mod lease;
pub mod logging;
pub mod models;
pub mod registry;
pub mod state_machine;
pub mod store;

pub use authz::{AccessDecision, Action, Authorizer};
pub use classifier::{classify, ErrorClass, HandlerError, HandlerErrorKind};
pub use config::ConductorConfig;
pub use coordinator::{CreateExecutionRequest, ExecutionCoordinator, ExecutionView, StepOutcome};
pub use definition::{
    BackoffStrategy, DefinitionDraft, DefinitionStore, OrchestrationDefinition, RetryPolicy,
    SafetyClass, StepDefinition, StepType, TransitionTarget,
};
pub use error::{ConductorError, Result};
pub use events::{Correlation, EngineEvent, EventPublisher};
pub use models::{AttemptOrigin, OrchestrationExecution, StepExecution};
pub use registry::{step_idempotency_key, HandlerRegistry, IdempotencyRegistry, StepHandler};
pub use state_machine::{ExecutionStatus, ExecutionSubstatus, StepAttemptStatus};
pub use store::{ExecutionStore, InMemoryStore};
