use serde::{Deserialize, Serialize};

/// Events that can trigger execution state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    /// Halt the execution pending a human approval signal
    AwaitApproval,
    /// An approval signal was granted; resume work
    ApprovalGranted,
    /// Pause the execution
    Pause,
    /// Resume a paused execution
    Resume,
    /// Mark the execution as succeeded
    Complete,
    /// Mark the execution as failed with an error message
    Fail(String),
    /// Cancel the execution
    Cancel,
}

impl ExecutionEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AwaitApproval => "await_approval",
            Self::ApprovalGranted => "approval_granted",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail(_) | Self::Cancel)
    }

    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
