use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution status definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Execution is actively progressing through its step graph
    Running,
    /// Execution is halted pending an explicit human approval signal
    WaitingApproval,
    /// Execution was paused by an operator
    Paused,
    /// Execution completed successfully
    Succeeded,
    /// Execution failed
    Failed,
    /// Execution was canceled
    Canceled,
}

impl ExecutionStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Check if the coordinator may dispatch new step attempts in this state
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::WaitingApproval => write!(f, "waiting_approval"),
            Self::Paused => write!(f, "paused"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "paused" => Ok(Self::Paused),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Running
    }
}

/// Substatus qualifier attached alongside the primary execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSubstatus {
    /// A non-retryable, partially-applied failure awaits manual compensation
    CompensationPending,
    /// The declared compensation handler ran after explicit approval
    CompensationApplied,
}

impl fmt::Display for ExecutionSubstatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompensationPending => write!(f, "compensation_pending"),
            Self::CompensationApplied => write!(f, "compensation_applied"),
        }
    }
}

/// Status of a single step attempt row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAttemptStatus {
    /// Attempt row materialized, not yet claimed by a worker
    Pending,
    /// A worker holds the lease and is invoking the handler
    Running,
    /// Attempt completed successfully
    Succeeded,
    /// Attempt failed and no further automatic attempt will be made
    Failed,
    /// Attempt failed and a new attempt has been scheduled
    Retrying,
    /// Attempt exceeded its per-attempt timeout
    TimedOut,
    /// Attempt was skipped (e.g. guard pre-check confirmed prior completion)
    Skipped,
    /// Attempt is parked awaiting a human approval signal
    AwaitingApproval,
}

impl StepAttemptStatus {
    /// Check if this attempt row is closed (its final status is recorded)
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Retrying | Self::TimedOut | Self::Skipped
        )
    }

    /// Check if this attempt satisfied the step (the graph may advance past it)
    pub fn satisfies_step(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Check if this attempt row is an open work item a worker may claim
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for StepAttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Skipped => write!(f, "skipped"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
        }
    }
}

impl std::str::FromStr for StepAttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "timed_out" => Ok(Self::TimedOut),
            "skipped" => Ok(Self::Skipped),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            _ => Err(format!("Invalid step attempt status: {s}")),
        }
    }
}

impl Default for StepAttemptStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_terminal_check() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Canceled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::WaitingApproval.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_accepts_work() {
        assert!(ExecutionStatus::Running.accepts_work());
        assert!(!ExecutionStatus::WaitingApproval.accepts_work());
        assert!(!ExecutionStatus::Paused.accepts_work());
        assert!(!ExecutionStatus::Canceled.accepts_work());
    }

    #[test]
    fn test_step_attempt_satisfaction() {
        assert!(StepAttemptStatus::Succeeded.satisfies_step());
        assert!(StepAttemptStatus::Skipped.satisfies_step());
        assert!(!StepAttemptStatus::Retrying.satisfies_step());
        assert!(!StepAttemptStatus::Failed.satisfies_step());
        assert!(!StepAttemptStatus::AwaitingApproval.satisfies_step());
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(ExecutionStatus::WaitingApproval.to_string(), "waiting_approval");
        assert_eq!(
            "canceled".parse::<ExecutionStatus>().unwrap(),
            ExecutionStatus::Canceled
        );
        assert_eq!(StepAttemptStatus::TimedOut.to_string(), "timed_out");
        assert_eq!(
            "awaiting_approval".parse::<StepAttemptStatus>().unwrap(),
            StepAttemptStatus::AwaitingApproval
        );
    }

    #[test]
    fn test_status_serde() {
        let status = ExecutionStatus::WaitingApproval;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"waiting_approval\"");

        let parsed: ExecutionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
