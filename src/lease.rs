//! # Concurrency Guard
//!
//! At most one active worker per `(execution_id, step_id)` at any instant.
//!
//! The guard is a thin policy layer over the store's lease primitive: claims
//! carry a TTL, must be renewed or released on completion, and an expired
//! lease is reclaimable by another worker, so a crashed worker never
//! deadlocks a step permanently. The guard does **not** prevent a step from
//! being attempted multiple times over the execution's lifetime — only
//! concurrently.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{ExecutionStore, Lease, LeaseClaim};

#[derive(Clone)]
pub struct ConcurrencyGuard {
    store: Arc<dyn ExecutionStore>,
    ttl: Duration,
}

impl ConcurrencyGuard {
    pub fn new(store: Arc<dyn ExecutionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Claim the step for `owner`, or learn who holds it
    pub async fn claim(
        &self,
        execution_id: Uuid,
        step_id: &str,
        owner: &str,
    ) -> Result<LeaseClaim> {
        let claim = self
            .store
            .claim_lease(execution_id, step_id, owner, self.ttl)
            .await?;
        match &claim {
            LeaseClaim::Acquired(lease) => {
                tracing::trace!(
                    execution_id = %execution_id,
                    step_id,
                    owner,
                    expires_at = %lease.expires_at,
                    "lease acquired"
                );
            }
            LeaseClaim::AlreadyClaimed { holder, .. } => {
                tracing::trace!(
                    execution_id = %execution_id,
                    step_id,
                    owner,
                    holder,
                    "lease contended"
                );
            }
        }
        Ok(claim)
    }

    /// Extend a held lease by the configured TTL
    pub async fn renew(&self, lease: &Lease) -> Result<bool> {
        self.store.renew_lease(lease, self.ttl).await
    }

    pub async fn release(&self, lease: &Lease) -> Result<()> {
        self.store.release_lease(lease).await
    }
}
