use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::template::{DefinitionDraft, OrchestrationDefinition};
use super::validation::validate_draft;
use crate::error::{ConductorError, Result};
use crate::registry::handlers::{HandlerRegistry, StepHandler};

/// Namespace for UUIDv5 content hashing of drafts
const CONTENT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x2b, 0x9e, 0x51, 0x7d, 0x0a, 0x6c, 0x5b, 0x84, 0x93, 0x1f, 0x8e, 0x2d, 0x7c, 0x6b, 0x5a,
    0x49,
]);

/// A frozen definition version with its handler bindings resolved at publish
/// time. Dispatch during execution is a map lookup; handler references are
/// never re-resolved per attempt.
pub struct ResolvedDefinition {
    pub definition: Arc<OrchestrationDefinition>,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    compensations: HashMap<String, Arc<dyn StepHandler>>,
}

impl std::fmt::Debug for ResolvedDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDefinition")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl ResolvedDefinition {
    /// The handler bound to `step_id`, if the step declares one
    pub fn handler_for(&self, step_id: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_id).map(Arc::clone)
    }

    /// The compensation handler bound to `step_id`, if declared
    pub fn compensation_for(&self, step_id: &str) -> Option<Arc<dyn StepHandler>> {
        self.compensations.get(step_id).map(Arc::clone)
    }
}

/// Holds immutable, versioned workflow templates.
///
/// Publish is idempotent on content: the same draft republished is a no-op
/// returning the existing `(id, version)`; different content under the same
/// logical name produces a new version. Published versions are never edited
/// or deleted; deprecation is a status flag.
pub struct DefinitionStore {
    registry: Arc<HandlerRegistry>,
    /// Serializes version allocation; reads never take it
    publish_lock: Mutex<()>,
    by_name: DashMap<String, Uuid>,
    versions: DashMap<(Uuid, u32), Arc<ResolvedDefinition>>,
    latest: DashMap<Uuid, u32>,
    by_hash: DashMap<Uuid, (Uuid, u32)>,
    deprecated: DashMap<(Uuid, u32), ()>,
}

impl DefinitionStore {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            publish_lock: Mutex::new(()),
            by_name: DashMap::new(),
            versions: DashMap::new(),
            latest: DashMap::new(),
            by_hash: DashMap::new(),
            deprecated: DashMap::new(),
        }
    }

    /// Validate, freeze, and version a draft.
    ///
    /// Handler references are resolved against the registry here, once;
    /// a missing handler fails the publish.
    pub fn publish(&self, draft: DefinitionDraft) -> Result<(Uuid, u32)> {
        validate_draft(&draft)?;
        let content_hash = Self::content_hash(&draft)?;

        if let Some(existing) = self.by_hash.get(&content_hash) {
            return Ok(*existing);
        }

        let _guard = self.publish_lock.lock();
        // A racing publisher may have frozen the same content first
        if let Some(existing) = self.by_hash.get(&content_hash) {
            return Ok(*existing);
        }

        let (handlers, compensations) = self.resolve_handlers(&draft)?;

        let entry_step = draft
            .entry()
            .ok_or_else(|| {
                ConductorError::ValidationError("definition has no entry step".to_string())
            })?
            .to_string();

        let definition_id = *self
            .by_name
            .entry(draft.name.clone())
            .or_insert_with(Uuid::new_v4);
        let version = self.latest.get(&definition_id).map(|v| *v + 1).unwrap_or(1);

        let definition = Arc::new(OrchestrationDefinition {
            definition_id,
            name: draft.name,
            version,
            content_hash,
            entry_step,
            steps: draft.steps,
            published_at: Utc::now(),
        });

        tracing::info!(
            definition = %definition.name,
            definition_id = %definition_id,
            version,
            steps = definition.steps.len(),
            "published definition version"
        );

        self.versions.insert(
            (definition_id, version),
            Arc::new(ResolvedDefinition {
                definition,
                handlers,
                compensations,
            }),
        );
        self.latest.insert(definition_id, version);
        self.by_hash.insert(content_hash, (definition_id, version));

        Ok((definition_id, version))
    }

    /// Fetch a frozen definition version
    pub fn get(&self, definition_id: Uuid, version: u32) -> Result<Arc<ResolvedDefinition>> {
        self.versions
            .get(&(definition_id, version))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ConductorError::DefinitionNotFound(definition_id, version))
    }

    /// Latest published version under a definition id
    pub fn latest_version(&self, definition_id: Uuid) -> Option<u32> {
        self.latest.get(&definition_id).map(|v| *v)
    }

    /// Look up a logical name's definition id
    pub fn id_for_name(&self, name: &str) -> Option<Uuid> {
        self.by_name.get(name).map(|id| *id)
    }

    /// Flag a published version as deprecated. Not a mutation of the
    /// definition itself; executions pinning it continue to run.
    pub fn deprecate(&self, definition_id: Uuid, version: u32) -> Result<()> {
        if !self.versions.contains_key(&(definition_id, version)) {
            return Err(ConductorError::DefinitionNotFound(definition_id, version));
        }
        self.deprecated.insert((definition_id, version), ());
        Ok(())
    }

    pub fn is_deprecated(&self, definition_id: Uuid, version: u32) -> bool {
        self.deprecated.contains_key(&(definition_id, version))
    }

    fn resolve_handlers(
        &self,
        draft: &DefinitionDraft,
    ) -> Result<(
        HashMap<String, Arc<dyn StepHandler>>,
        HashMap<String, Arc<dyn StepHandler>>,
    )> {
        let mut handlers = HashMap::new();
        let mut compensations = HashMap::new();
        for step in &draft.steps {
            if let Some(name) = &step.handler {
                let handler = self
                    .registry
                    .get(name)
                    .ok_or_else(|| ConductorError::HandlerNotRegistered(name.clone()))?;
                handlers.insert(step.step_id.clone(), handler);
            }
            if let Some(name) = &step.compensation_handler {
                let handler = self
                    .registry
                    .get(name)
                    .ok_or_else(|| ConductorError::HandlerNotRegistered(name.clone()))?;
                compensations.insert(step.step_id.clone(), handler);
            }
        }
        Ok((handlers, compensations))
    }

    /// UUIDv5 over the draft's canonical JSON. `serde_json` keeps object
    /// keys sorted, so map-typed fields hash deterministically.
    fn content_hash(draft: &DefinitionDraft) -> Result<Uuid> {
        let canonical = serde_json::to_value(draft)?.to_string();
        Ok(Uuid::new_v5(&CONTENT_NAMESPACE, canonical.as_bytes()))
    }
}
