//! Error types for the conductor engine.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConductorError {
    #[error("Definition error: {0}")]
    DefinitionError(String),
    #[error("Definition not found: {0} v{1}")]
    DefinitionNotFound(Uuid, u32),
    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),
    #[error("Step not found in definition: {0}")]
    StepNotFound(String),
    #[error("Handler not registered: {0}")]
    HandlerNotRegistered(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Execution {execution_id} is terminal ({status}): {reason}")]
    TerminalExecution {
        execution_id: Uuid,
        status: String,
        reason: String,
    },
    #[error("Permission denied for '{actor}' performing {action} on {resource}: {trace}")]
    PermissionDenied {
        actor: String,
        action: String,
        resource: String,
        trace: String,
    },
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Event error: {0}")]
    EventError(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for ConductorError {
    fn from(error: serde_json::Error) -> Self {
        ConductorError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<crate::state_machine::StateMachineError> for ConductorError {
    fn from(error: crate::state_machine::StateMachineError) -> Self {
        ConductorError::StateTransitionError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
