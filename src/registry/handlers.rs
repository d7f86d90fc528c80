//! # Step Handler Registry
//!
//! Maps handler names to step handler capabilities. Definitions reference
//! handlers by name; the definition store resolves those references against
//! this registry exactly once at publish time, so dispatch during execution
//! is a plain map lookup with no runtime type inspection.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::classifier::HandlerError;

/// A step's unit of work, invoked by workers.
///
/// The engine treats handlers as opaque: it passes the step idempotency key
/// (stable across attempts, so the handler can deduplicate on its side) and
/// the execution input, and classifies only the reported error.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Perform the step's side effect
    async fn handle(
        &self,
        idempotency_key: Uuid,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;

    /// Guard pre-check for `SAFE_TO_RETRY_WITH_GUARD` steps: report the
    /// prior result if the side effect already completed under this key.
    ///
    /// The default claims no prior completion, which is correct for
    /// naturally idempotent handlers.
    async fn check_completed(
        &self,
        _idempotency_key: Uuid,
    ) -> Result<Option<serde_json::Value>, HandlerError> {
        Ok(None)
    }
}

/// In-process registry of named handler capabilities
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler under a name. Re-registration replaces the entry;
    /// already-published definitions keep the capability they resolved.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let name = name.into();
        tracing::debug!(handler = %name, "registering step handler");
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        async fn handle(
            &self,
            _idempotency_key: Uuid,
            input: &serde_json::Value,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(input.clone())
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));

        assert!(registry.contains("echo"));
        let handler = registry.get("echo").unwrap();
        let result = handler
            .handle(Uuid::new_v4(), &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_default_guard_reports_no_completion() {
        let handler = Echo;
        assert!(handler.check_completed(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn test_missing_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("absent").is_none());
    }
}
