//! # Observability Sink
//!
//! Typed engine events published over a broadcast channel for external
//! consumers. Each event carries a correlation identifier threading
//! `execution_id` → `step_execution_id` → the handler call's idempotency
//! key, so a consumer can stitch the full causal chain back together. This
//! is an outbound interface only; storage and querying are out of scope.

pub mod publisher;

pub use publisher::{EventPublisher, PublishError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::ErrorClass;
use crate::state_machine::{ExecutionStatus, StepAttemptStatus};

/// Correlation identifier attached to every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub execution_id: Uuid,
    pub step_id: Option<String>,
    pub step_execution_id: Option<Uuid>,
    /// The key passed to the external handler, when a handler was involved
    pub idempotency_key: Option<Uuid>,
}

impl Correlation {
    pub fn execution(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            step_id: None,
            step_execution_id: None,
            idempotency_key: None,
        }
    }

    pub fn step(
        execution_id: Uuid,
        step_id: impl Into<String>,
        step_execution_id: Uuid,
        idempotency_key: Uuid,
    ) -> Self {
        Self {
            execution_id,
            step_id: Some(step_id.into()),
            step_execution_id: Some(step_execution_id),
            idempotency_key: Some(idempotency_key),
        }
    }
}

/// Lifecycle events consumed by the observability sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ExecutionCreated {
        correlation: Correlation,
        tenant: String,
        definition_id: Uuid,
        definition_version: u32,
    },
    ExecutionSucceeded {
        correlation: Correlation,
    },
    ExecutionFailed {
        correlation: Correlation,
        error_class: Option<ErrorClass>,
        reason: String,
    },
    ExecutionCanceled {
        correlation: Correlation,
    },
    StepAttemptStarted {
        correlation: Correlation,
        attempt_number: u32,
    },
    StepAttemptFinished {
        correlation: Correlation,
        attempt_number: u32,
        status: StepAttemptStatus,
        error_class: Option<ErrorClass>,
        retry_after_at: Option<DateTime<Utc>>,
    },
    ApprovalRequested {
        correlation: Correlation,
    },
    CompensationRequired {
        correlation: Correlation,
        reason: String,
        has_compensation_handler: bool,
    },
    /// Audit record for permission-gated human actions
    ManualAction {
        correlation: Correlation,
        actor: String,
        action: String,
        resulting_status: ExecutionStatus,
    },
}

impl EngineEvent {
    /// Event name for logging and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionCreated { .. } => "execution_created",
            Self::ExecutionSucceeded { .. } => "execution_succeeded",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionCanceled { .. } => "execution_canceled",
            Self::StepAttemptStarted { .. } => "step_attempt_started",
            Self::StepAttemptFinished { .. } => "step_attempt_finished",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::CompensationRequired { .. } => "compensation_required",
            Self::ManualAction { .. } => "manual_action",
        }
    }

    pub fn correlation(&self) -> &Correlation {
        match self {
            Self::ExecutionCreated { correlation, .. }
            | Self::ExecutionSucceeded { correlation }
            | Self::ExecutionFailed { correlation, .. }
            | Self::ExecutionCanceled { correlation }
            | Self::StepAttemptStarted { correlation, .. }
            | Self::StepAttemptFinished { correlation, .. }
            | Self::ApprovalRequested { correlation }
            | Self::CompensationRequired { correlation, .. }
            | Self::ManualAction { correlation, .. } => correlation,
        }
    }
}
