//! # Compensation Router
//!
//! When automatic retry is unsafe — a step marked `NOT_SAFE_TO_RETRY`, or an
//! error classified `COMPENSATION_REQUIRED` — the router moves the execution
//! to a human-reviewable halted state instead of looping. With a declared
//! compensation handler the execution parks in `waiting_approval` (the
//! handler runs only after an explicit approval signal); without one it
//! closes as `failed` with the `compensation_pending` substatus. Either way
//! the failure is surfaced through the observability sink and never
//! auto-retried.

use chrono::Utc;

use crate::classifier::ErrorClass;
use crate::error::{ConductorError, Result};
use crate::events::{Correlation, EngineEvent, EventPublisher};
use crate::models::{OrchestrationExecution, StepExecution};
use crate::state_machine::{
    ExecutionEvent, ExecutionStateMachine, ExecutionStatus, ExecutionSubstatus,
};
use crate::store::ExecutionStore;

#[derive(Clone)]
pub struct CompensationRouter {
    publisher: EventPublisher,
}

impl CompensationRouter {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }

    /// Halt the execution for manual review after an unsafe failure.
    ///
    /// Returns the status the execution halted in.
    pub async fn route(
        &self,
        store: &dyn ExecutionStore,
        mut execution: OrchestrationExecution,
        row: &StepExecution,
        class: ErrorClass,
        reason: &str,
        has_compensation_handler: bool,
    ) -> Result<ExecutionStatus> {
        let correlation = Correlation::step(
            execution.execution_id,
            row.step_id.clone(),
            row.step_execution_id,
            row.idempotency_key,
        );

        tracing::warn!(
            execution_id = %execution.execution_id,
            step_id = %row.step_id,
            error_class = %class,
            has_compensation_handler,
            "routing unsafe failure to manual review"
        );

        self.publisher.publish(EngineEvent::CompensationRequired {
            correlation: correlation.clone(),
            reason: reason.to_string(),
            has_compensation_handler,
        });

        let expected = execution.status;
        let halted = if has_compensation_handler {
            let target =
                ExecutionStateMachine::target_state(expected, &ExecutionEvent::AwaitApproval)?;
            execution.status = target;
            execution.substatus = Some(ExecutionSubstatus::CompensationPending);
            target
        } else {
            let target = ExecutionStateMachine::target_state(
                expected,
                &ExecutionEvent::fail_with_error(reason),
            )?;
            execution.status = target;
            execution.substatus = Some(ExecutionSubstatus::CompensationPending);
            execution.completed_at = Some(Utc::now());
            execution.current_step = None;
            target
        };

        if !store.cas_execution(expected, execution).await? {
            return Err(ConductorError::StateTransitionError(format!(
                "execution status changed concurrently while routing step '{}' to compensation",
                row.step_id
            )));
        }

        match halted {
            ExecutionStatus::WaitingApproval => {
                self.publisher
                    .publish(EngineEvent::ApprovalRequested { correlation });
            }
            ExecutionStatus::Failed => {
                self.publisher.publish(EngineEvent::ExecutionFailed {
                    correlation,
                    error_class: Some(class),
                    reason: reason.to_string(),
                });
            }
            other => {
                return Err(ConductorError::InvalidState(format!(
                    "compensation routing produced unexpected status {other}"
                )))
            }
        }

        Ok(halted)
    }
}
