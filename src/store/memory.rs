//! In-memory [`ExecutionStore`] with the same atomicity contract a
//! transactional database provides: key inserts, the status CAS, and lease
//! claims each resolve under a single map-entry lock.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{ExecutionStore, KeyInsert, Lease, LeaseClaim};
use crate::error::{ConductorError, Result};
use crate::models::{OrchestrationExecution, StepExecution};
use crate::state_machine::ExecutionStatus;

#[derive(Default)]
pub struct InMemoryStore {
    execution_keys: DashMap<(String, String), Uuid>,
    executions: DashMap<Uuid, OrchestrationExecution>,
    history: DashMap<Uuid, Vec<StepExecution>>,
    leases: DashMap<(Uuid, String), Lease>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn insert_execution_key(
        &self,
        tenant: &str,
        key: &str,
        execution_id: Uuid,
    ) -> Result<KeyInsert> {
        match self
            .execution_keys
            .entry((tenant.to_string(), key.to_string()))
        {
            Entry::Occupied(existing) => Ok(KeyInsert::Conflict(*existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(execution_id);
                Ok(KeyInsert::Inserted)
            }
        }
    }

    async fn insert_execution(&self, execution: OrchestrationExecution) -> Result<()> {
        let execution_id = execution.execution_id;
        match self.executions.entry(execution_id) {
            Entry::Occupied(_) => Err(ConductorError::StorageError(format!(
                "execution {execution_id} already exists"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution);
                self.history.entry(execution_id).or_default();
                Ok(())
            }
        }
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<OrchestrationExecution>> {
        Ok(self.executions.get(&execution_id).map(|e| e.clone()))
    }

    async fn cas_execution(
        &self,
        expected_status: ExecutionStatus,
        updated: OrchestrationExecution,
    ) -> Result<bool> {
        let mut entry = self
            .executions
            .get_mut(&updated.execution_id)
            .ok_or(ConductorError::ExecutionNotFound(updated.execution_id))?;
        if entry.status != expected_status {
            return Ok(false);
        }
        *entry = updated;
        Ok(true)
    }

    async fn append_step_execution(&self, row: StepExecution) -> Result<()> {
        let execution = self
            .executions
            .get(&row.execution_id)
            .ok_or(ConductorError::ExecutionNotFound(row.execution_id))?;
        if execution.status.is_terminal() {
            return Err(ConductorError::TerminalExecution {
                execution_id: row.execution_id,
                status: execution.status.to_string(),
                reason: format!("cannot append attempt for step '{}'", row.step_id),
            });
        }
        drop(execution);

        self.history.entry(row.execution_id).or_default().push(row);
        Ok(())
    }

    async fn update_step_execution(&self, row: StepExecution) -> Result<()> {
        let mut rows = self
            .history
            .get_mut(&row.execution_id)
            .ok_or(ConductorError::ExecutionNotFound(row.execution_id))?;
        let slot = rows
            .iter_mut()
            .find(|r| r.step_execution_id == row.step_execution_id)
            .ok_or_else(|| {
                ConductorError::StorageError(format!(
                    "step execution {} not found",
                    row.step_execution_id
                ))
            })?;
        *slot = row;
        Ok(())
    }

    async fn step_history(&self, execution_id: Uuid) -> Result<Vec<StepExecution>> {
        Ok(self
            .history
            .get(&execution_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn claim_lease(
        &self,
        execution_id: Uuid,
        step_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LeaseClaim> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| ConductorError::StorageError(format!("lease ttl overflow: {e}")))?;
        let fresh = Lease {
            execution_id,
            step_id: step_id.to_string(),
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            expires_at,
        };

        match self.leases.entry((execution_id, step_id.to_string())) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now {
                    // Expired lease from a crashed worker: reclaim
                    held.insert(fresh.clone());
                    Ok(LeaseClaim::Acquired(fresh))
                } else {
                    Ok(LeaseClaim::AlreadyClaimed {
                        holder: held.get().owner.clone(),
                        expires_at: held.get().expires_at,
                    })
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh.clone());
                Ok(LeaseClaim::Acquired(fresh))
            }
        }
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<bool> {
        let extended = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| ConductorError::StorageError(format!("lease ttl overflow: {e}")))?;
        match self
            .leases
            .get_mut(&(lease.execution_id, lease.step_id.clone()))
        {
            Some(mut held) if held.token == lease.token => {
                held.expires_at = extended;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        self.leases
            .remove_if(&(lease.execution_id, lease.step_id.clone()), |_, held| {
                held.token == lease.token
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttemptOrigin;

    fn execution(status: ExecutionStatus) -> OrchestrationExecution {
        OrchestrationExecution {
            execution_id: Uuid::new_v4(),
            tenant: "acme".to_string(),
            definition_id: Uuid::new_v4(),
            definition_version: 1,
            status,
            substatus: None,
            input: serde_json::json!({}),
            idempotency_key: "key-1".to_string(),
            current_step: Some("a".to_string()),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_key_insert_conflict_returns_winner() {
        let store = InMemoryStore::new();
        let winner = Uuid::new_v4();
        assert_eq!(
            store.insert_execution_key("acme", "k", winner).await.unwrap(),
            KeyInsert::Inserted
        );
        assert_eq!(
            store
                .insert_execution_key("acme", "k", Uuid::new_v4())
                .await
                .unwrap(),
            KeyInsert::Conflict(winner)
        );
        // Same key under a different tenant is independent
        assert_eq!(
            store
                .insert_execution_key("other", "k", Uuid::new_v4())
                .await
                .unwrap(),
            KeyInsert::Inserted
        );
    }

    #[tokio::test]
    async fn test_cas_refuses_stale_status() {
        let store = InMemoryStore::new();
        let exec = execution(ExecutionStatus::Running);
        store.insert_execution(exec.clone()).await.unwrap();

        let mut updated = exec.clone();
        updated.status = ExecutionStatus::Paused;
        assert!(store
            .cas_execution(ExecutionStatus::Running, updated.clone())
            .await
            .unwrap());

        // Second CAS against the old expectation must fail
        let mut stale = exec;
        stale.status = ExecutionStatus::Canceled;
        assert!(!store
            .cas_execution(ExecutionStatus::Running, stale)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_append_rejected_for_terminal_execution() {
        let store = InMemoryStore::new();
        let exec = execution(ExecutionStatus::Succeeded);
        let execution_id = exec.execution_id;
        store.insert_execution(exec).await.unwrap();

        let row = StepExecution::materialize(
            execution_id,
            "a",
            1,
            AttemptOrigin::Entry,
            Uuid::new_v4(),
        );
        let err = store.append_step_execution(row).await.unwrap_err();
        assert!(matches!(err, ConductorError::TerminalExecution { .. }));
    }

    #[tokio::test]
    async fn test_lease_mutual_exclusion_and_reclaim() {
        let store = InMemoryStore::new();
        let execution_id = Uuid::new_v4();

        let first = store
            .claim_lease(execution_id, "a", "worker-1", Duration::from_millis(40))
            .await
            .unwrap();
        let lease = match first {
            LeaseClaim::Acquired(lease) => lease,
            other => panic!("expected acquisition, got {other:?}"),
        };

        let contended = store
            .claim_lease(execution_id, "a", "worker-2", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(
            matches!(contended, LeaseClaim::AlreadyClaimed { ref holder, .. } if holder == "worker-1")
        );

        // After expiry the lease is reclaimable and the stale holder cannot
        // renew or release it.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let reclaimed = store
            .claim_lease(execution_id, "a", "worker-2", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(reclaimed.is_acquired());
        assert!(!store.renew_lease(&lease, Duration::from_millis(40)).await.unwrap());
        store.release_lease(&lease).await.unwrap();
        let still_held = store
            .claim_lease(execution_id, "a", "worker-3", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(!still_held.is_acquired());
    }

    #[tokio::test]
    async fn test_renew_extends_held_lease() {
        let store = InMemoryStore::new();
        let claim = store
            .claim_lease(Uuid::new_v4(), "a", "worker-1", Duration::from_millis(50))
            .await
            .unwrap();
        let lease = match claim {
            LeaseClaim::Acquired(lease) => lease,
            other => panic!("expected acquisition, got {other:?}"),
        };
        assert!(store.renew_lease(&lease, Duration::from_secs(5)).await.unwrap());
    }
}
