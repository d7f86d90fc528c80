//! # Idempotency Registry
//!
//! Two independent at-most-once guarantees:
//!
//! - **Execution-level**: the first caller to reserve a
//!   `(tenant, caller_idempotency_key)` pair wins; every later caller —
//!   concurrent or repeated — reads back the winner's `execution_id` with no
//!   side effects. Serialization rides on the store's unique-constraint
//!   insert.
//! - **Step-level**: the step idempotency key is derived deterministically
//!   from `(tenant, execution_id, step_id)`, so it is constant across
//!   attempts and the external handler can deduplicate on it.

use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{ExecutionStore, KeyInsert};

/// Namespace for UUIDv5 key derivation; fixed so keys are stable across
/// processes and restarts.
pub const KEY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x1c, 0x2a, 0x8e, 0x4b, 0x3d, 0x5e, 0x9a, 0x8c, 0x7b, 0x6d, 0x5f, 0x4e, 0x3a, 0x2b,
    0x1c,
]);

/// Derive the stable step idempotency key for `(tenant, execution_id, step_id)`
pub fn step_idempotency_key(tenant: &str, execution_id: Uuid, step_id: &str) -> Uuid {
    let material = format!("{tenant}:{execution_id}:{step_id}");
    Uuid::new_v5(&KEY_NAMESPACE, material.as_bytes())
}

/// Execution-level idempotency over the durable store
#[derive(Clone)]
pub struct IdempotencyRegistry {
    store: Arc<dyn ExecutionStore>,
}

/// Outcome of an execution-key reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// This caller won the race; it must create the execution
    Won,
    /// Another caller already created the execution with this key
    Existing(Uuid),
}

impl IdempotencyRegistry {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Reserve `(tenant, key)` for `candidate_id`. Exactly one concurrent
    /// caller observes [`Reservation::Won`]; the rest observe the winner's id.
    pub async fn reserve(&self, tenant: &str, key: &str, candidate_id: Uuid) -> Result<Reservation> {
        match self.store.insert_execution_key(tenant, key, candidate_id).await? {
            KeyInsert::Inserted => Ok(Reservation::Won),
            KeyInsert::Conflict(existing) => Ok(Reservation::Existing(existing)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_key_is_stable_across_attempts() {
        let execution_id = Uuid::new_v4();
        let first = step_idempotency_key("acme", execution_id, "issue_invoice");
        let second = step_idempotency_key("acme", execution_id, "issue_invoice");
        assert_eq!(first, second);
    }

    #[test]
    fn test_step_key_varies_by_component() {
        let execution_id = Uuid::new_v4();
        let base = step_idempotency_key("acme", execution_id, "issue_invoice");
        assert_ne!(base, step_idempotency_key("other", execution_id, "issue_invoice"));
        assert_ne!(base, step_idempotency_key("acme", Uuid::new_v4(), "issue_invoice"));
        assert_ne!(base, step_idempotency_key("acme", execution_id, "notify_client"));
    }
}
