use super::{events::ExecutionEvent, states::ExecutionStatus, StateMachineError, StateMachineResult};

/// Pure transition table for execution statuses.
///
/// The coordinator evaluates every status change through this table before
/// persisting it. An illegal combination is a programming error and fails
/// loudly with [`StateMachineError::InvalidTransition`]; it is never treated
/// as a retryable condition.
pub struct ExecutionStateMachine;

impl ExecutionStateMachine {
    /// Determine the target status for an event applied to the current status
    pub fn target_state(
        current: ExecutionStatus,
        event: &ExecutionEvent,
    ) -> StateMachineResult<ExecutionStatus> {
        let target = match (current, event) {
            // Approval gate
            (ExecutionStatus::Running, ExecutionEvent::AwaitApproval) => {
                ExecutionStatus::WaitingApproval
            }
            (ExecutionStatus::WaitingApproval, ExecutionEvent::ApprovalGranted) => {
                ExecutionStatus::Running
            }

            // Operator pause
            (ExecutionStatus::Running, ExecutionEvent::Pause) => ExecutionStatus::Paused,
            (ExecutionStatus::Paused, ExecutionEvent::Resume) => ExecutionStatus::Running,

            // Terminal transitions
            (ExecutionStatus::Running, ExecutionEvent::Complete) => ExecutionStatus::Succeeded,
            (ExecutionStatus::Running, ExecutionEvent::Fail(_)) => ExecutionStatus::Failed,
            (ExecutionStatus::Running, ExecutionEvent::Cancel) => ExecutionStatus::Canceled,
            (ExecutionStatus::WaitingApproval, ExecutionEvent::Cancel) => ExecutionStatus::Canceled,
            (ExecutionStatus::Paused, ExecutionEvent::Cancel) => ExecutionStatus::Canceled,

            // A failure raised while approval is pending (e.g. a declined
            // compensation) still closes the execution.
            (ExecutionStatus::WaitingApproval, ExecutionEvent::Fail(_)) => ExecutionStatus::Failed,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }
}
