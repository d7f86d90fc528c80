use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{ExecutionStatus, ExecutionSubstatus};

/// One run of a definition against a target object.
///
/// Owned exclusively by the coordinator: created once, status-transitioned
/// many times, never deleted. Terminal rows are retained for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationExecution {
    pub execution_id: Uuid,
    pub tenant: String,
    /// Pinned definition: executions never float to a newer version
    pub definition_id: Uuid,
    pub definition_version: u32,
    pub status: ExecutionStatus,
    pub substatus: Option<ExecutionSubstatus>,
    /// Input snapshot, validated at creation and immutable thereafter
    pub input: serde_json::Value,
    /// Caller-supplied key, unique per tenant
    pub idempotency_key: String,
    /// Frontier step the execution is currently on; `None` once terminal
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrchestrationExecution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Short descriptor used in tracing fields
    pub fn definition_ref(&self) -> String {
        format!("{}@v{}", self.definition_id, self.definition_version)
    }
}
