use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::ErrorClass;
use crate::state_machine::StepAttemptStatus;

/// How an attempt row came to exist, kept for audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOrigin {
    /// The coordinator entered the step via the transition graph
    Entry,
    /// The retry matrix scheduled a new attempt after a recoverable failure
    AutomaticRetry,
    /// An authorized human requested a re-attempt
    ManualRetry,
    /// The declared compensation handler ran after explicit approval
    Compensation,
}

/// One attempt of one step within one execution.
///
/// Attempt rows are append-only: a retry is a new row, never an overwrite,
/// so `get_execution` always shows a complete, truthful history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_execution_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    /// Monotonic per step across the execution's lifetime
    pub attempt_number: u32,
    pub origin: AttemptOrigin,
    pub status: StepAttemptStatus,
    pub error_class: Option<ErrorClass>,
    /// Redacted handler error summary; never used for branching
    pub error_summary: Option<String>,
    /// Earliest instant a worker may run this attempt
    pub retry_after_at: Option<DateTime<Utc>>,
    /// Delay that produced `retry_after_at`, kept for decorrelated jitter
    pub backoff_ms: Option<u64>,
    /// Derived key, constant across attempts of this step; passed to the
    /// handler so it can deduplicate on its side
    pub idempotency_key: Uuid,
    /// Bounded result payload
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Materialize a fresh attempt row in `pending` status
    pub fn materialize(
        execution_id: Uuid,
        step_id: impl Into<String>,
        attempt_number: u32,
        origin: AttemptOrigin,
        idempotency_key: Uuid,
    ) -> Self {
        Self {
            step_execution_id: Uuid::new_v4(),
            execution_id,
            step_id: step_id.into(),
            attempt_number,
            origin,
            status: StepAttemptStatus::Pending,
            error_class: None,
            error_summary: None,
            retry_after_at: None,
            backoff_ms: None,
            idempotency_key,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Check if this attempt is due for processing at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.retry_after_at {
            Some(at) => now >= at,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialized_row_is_pending_and_due() {
        let row = StepExecution::materialize(
            Uuid::new_v4(),
            "issue_invoice",
            1,
            AttemptOrigin::Entry,
            Uuid::new_v4(),
        );
        assert_eq!(row.status, StepAttemptStatus::Pending);
        assert_eq!(row.attempt_number, 1);
        assert!(row.is_due(Utc::now()));
        assert!(row.result.is_none());
        assert!(row.error_class.is_none());
    }

    #[test]
    fn test_scheduled_row_is_not_due_early() {
        let mut row = StepExecution::materialize(
            Uuid::new_v4(),
            "notify_client",
            2,
            AttemptOrigin::AutomaticRetry,
            Uuid::new_v4(),
        );
        let now = Utc::now();
        row.retry_after_at = Some(now + chrono::Duration::seconds(30));
        assert!(!row.is_due(now));
        assert!(row.is_due(now + chrono::Duration::seconds(31)));
    }
}
