//! Data model for executions and their append-only attempt history.

pub mod execution;
pub mod step_execution;

pub use execution::OrchestrationExecution;
pub use step_execution::{AttemptOrigin, StepExecution};
