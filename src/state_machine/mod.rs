//! # Execution State Management
//!
//! State definitions and the transition table for orchestration executions and
//! step attempts. The execution machine is deliberately small: the only legal
//! transitions are the ones listed in [`ExecutionStateMachine::target_state`],
//! and anything else is a programming error surfaced as
//! [`StateMachineError::InvalidTransition`] rather than a retryable condition.

pub mod events;
pub mod machine;
pub mod states;

pub use events::ExecutionEvent;
pub use machine::ExecutionStateMachine;
pub use states::{ExecutionStatus, ExecutionSubstatus, StepAttemptStatus};

use thiserror::Error;

/// Errors raised by state machine evaluation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },
    #[error("Internal state machine error: {0}")]
    Internal(String),
}

pub type StateMachineResult<T> = std::result::Result<T, StateMachineError>;
