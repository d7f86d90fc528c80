//! # Definition Store
//!
//! Immutable, versioned workflow templates.
//!
//! A definition is published once and never mutated: a "change" is always a
//! new version under the same logical name, and an execution pins the exact
//! `(definition_id, version)` it was created against. Publish is idempotent
//! on content (a UUIDv5 hash of the canonical JSON), validates the step
//! graph, and resolves every handler reference against the handler registry
//! exactly once — never re-resolved per attempt.

pub mod store;
pub mod template;
pub mod validation;

pub use store::{DefinitionStore, ResolvedDefinition};
pub use template::{
    BackoffStrategy, DefinitionDraft, OrchestrationDefinition, RetryPolicy, SafetyClass,
    StepDefinition, StepType, TransitionTarget,
};
