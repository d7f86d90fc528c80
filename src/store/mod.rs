//! # Durable Store Interface
//!
//! The engine layers its execution semantics on top of a durable
//! transactional store. Everything the coordinator needs from it is captured
//! here: unique-constraint inserts (execution idempotency keys), a
//! compare-and-set status write (state machine serialization), append-only
//! history writes, and row leasing with a TTL. All cross-worker coordination
//! state lives behind this trait; workers themselves are stateless and can
//! crash and restart without special recovery code.
//!
//! [`InMemoryStore`] is the bundled implementation, faithful to the same
//! atomicity contract, used for embedding and tests.

pub mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{OrchestrationExecution, StepExecution};
use crate::state_machine::ExecutionStatus;

/// Outcome of a unique-constraint key insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInsert {
    /// This write created the row
    Inserted,
    /// A row already exists; carries the winning execution id
    Conflict(Uuid),
}

/// A time-bounded exclusive claim on one `(execution_id, step_id)`
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub execution_id: Uuid,
    pub step_id: String,
    pub owner: String,
    /// Fencing token: renew/release are refused for a stale lease
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a lease claim attempt
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseClaim {
    Acquired(Lease),
    AlreadyClaimed {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl LeaseClaim {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Transactional primitives the engine requires from its durable store
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Unique-constraint insert for `(tenant, caller_idempotency_key)`.
    /// Exactly one concurrent writer observes [`KeyInsert::Inserted`].
    async fn insert_execution_key(
        &self,
        tenant: &str,
        key: &str,
        execution_id: Uuid,
    ) -> Result<KeyInsert>;

    async fn insert_execution(&self, execution: OrchestrationExecution) -> Result<()>;

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<OrchestrationExecution>>;

    /// Replace the execution row only if its current status equals
    /// `expected_status`. Returns whether the write applied.
    async fn cas_execution(
        &self,
        expected_status: ExecutionStatus,
        updated: OrchestrationExecution,
    ) -> Result<bool>;

    /// Append one attempt row. Rejected with
    /// [`crate::error::ConductorError::TerminalExecution`] when the owning
    /// execution is terminal: history against closed executions is a defect,
    /// not a silent no-op.
    async fn append_step_execution(&self, row: StepExecution) -> Result<()>;

    /// Rewrite an existing attempt row in place (status progression on the
    /// same attempt; retries append new rows instead)
    async fn update_step_execution(&self, row: StepExecution) -> Result<()>;

    /// Full attempt history for an execution, in append order
    async fn step_history(&self, execution_id: Uuid) -> Result<Vec<StepExecution>>;

    /// Claim the `(execution_id, step_id)` lease. An expired lease is
    /// reclaimable by any worker.
    async fn claim_lease(
        &self,
        execution_id: Uuid,
        step_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LeaseClaim>;

    /// Extend a held lease; refused (false) when the lease was lost
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<bool>;

    /// Release a held lease; releasing a lost lease is a no-op
    async fn release_lease(&self, lease: &Lease) -> Result<()>;
}
