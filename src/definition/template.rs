use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::classifier::{ClassifierOverrides, ErrorClass};

/// Kinds of steps a definition may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Ordinary unit of work against a domain object
    Task,
    /// Handler output selects the next step via declared routes
    Decision,
    /// Completes without a handler once its delay elapses
    Wait,
    /// Call to an external collaborator
    ExternalCall,
    /// Outbound notification (email, webhook, ...)
    Notify,
    /// Parks the execution until an authorized human approves
    HumanApproval,
}

impl StepType {
    /// Step types that invoke a registered handler
    pub fn requires_handler(&self) -> bool {
        matches!(
            self,
            Self::Task | Self::Decision | Self::ExternalCall | Self::Notify
        )
    }
}

/// Declared safety class governing automatic retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClass {
    /// Handler is naturally idempotent; retry freely
    SafeToRetry,
    /// Retry only after a guard pre-check confirms no prior completion
    SafeToRetryWithGuard,
    /// Never auto-retry; only an explicit human re-attempt is allowed
    NotSafeToRetry,
}

/// Where a transition edge leads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "step", rename_all = "snake_case")]
pub enum TransitionTarget {
    /// Another step in the same definition version
    Step(String),
    /// Terminal marker: the execution succeeds
    Succeed,
    /// Terminal marker: the execution fails
    Fail,
}

impl TransitionTarget {
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::Step(id) => Some(id),
            _ => None,
        }
    }
}

/// Backoff strategy for scheduling automatic retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay of `initial_delay_ms`
    Fixed,
    /// `initial_delay_ms * 2^(attempt - 1)`, capped at `max_delay_ms`
    Exponential,
    /// Decorrelated jitter: `min(max, rand(initial, prev * 3))`
    DecorrelatedJitter,
}

/// Per-step retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Error classes the matrix may recover by scheduling a new attempt
    pub retry_on_classes: Vec<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            retry_on_classes: vec![
                ErrorClass::Transient,
                ErrorClass::Retryable,
                ErrorClass::RateLimited,
                ErrorClass::DependencyFailed,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn retries(&self, class: ErrorClass) -> bool {
        class.is_auto_recoverable() && self.retry_on_classes.contains(&class)
    }
}

/// Definition-time description of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a definition version
    pub step_id: String,
    pub step_type: StepType,
    /// Registered handler name; required for handler-bearing step types
    pub handler: Option<String>,
    pub safety: SafetyClass,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    pub timeout_ms: u64,
    /// Defaults to the terminal `Succeed` marker when absent
    pub on_success: Option<TransitionTarget>,
    /// Taken after retry exhaustion on a recoverable class; never for
    /// NON_RETRYABLE or COMPENSATION_REQUIRED failures
    pub on_failure: Option<TransitionTarget>,
    /// Like `on_failure`, but for exhausted timeout attempts
    pub on_timeout: Option<TransitionTarget>,
    /// Decision steps: handler result `"decision"` key -> next step id
    #[serde(default)]
    pub routes: HashMap<String, String>,
    /// Wait steps: delay before the step completes
    pub wait_ms: Option<u64>,
    /// Loop bound: how many times the graph may enter this step
    pub max_visits: Option<u32>,
    #[serde(default)]
    pub classifier_overrides: ClassifierOverrides,
    /// Registered handler run (after explicit approval) to compensate a
    /// partially-applied failure of this step
    pub compensation_handler: Option<String>,
}

impl StepDefinition {
    /// A task step with sensible defaults; callers adjust fields after
    pub fn task(step_id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_type: StepType::Task,
            handler: Some(handler.into()),
            safety: SafetyClass::SafeToRetry,
            retry_policy: RetryPolicy::default(),
            timeout_ms: 30_000,
            on_success: None,
            on_failure: None,
            on_timeout: None,
            routes: HashMap::new(),
            wait_ms: None,
            max_visits: None,
            classifier_overrides: ClassifierOverrides::default(),
            compensation_handler: None,
        }
    }

    pub fn wait(step_id: impl Into<String>, wait_ms: u64) -> Self {
        let mut step = Self::task(step_id, "");
        step.step_type = StepType::Wait;
        step.handler = None;
        step.wait_ms = Some(wait_ms);
        step
    }

    pub fn human_approval(step_id: impl Into<String>) -> Self {
        let mut step = Self::task(step_id, "");
        step.step_type = StepType::HumanApproval;
        step.handler = None;
        step
    }

    pub fn decision(
        step_id: impl Into<String>,
        handler: impl Into<String>,
        routes: HashMap<String, String>,
    ) -> Self {
        let mut step = Self::task(step_id, handler);
        step.step_type = StepType::Decision;
        step.routes = routes;
        step
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.on_success = Some(TransitionTarget::Step(next.into()));
        self
    }

    /// The effective success target (`Succeed` when none declared)
    pub fn success_target(&self) -> TransitionTarget {
        self.on_success.clone().unwrap_or(TransitionTarget::Succeed)
    }
}

/// Draft submitted to [`crate::definition::DefinitionStore::publish`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionDraft {
    /// Logical name; versions accumulate under it
    pub name: String,
    /// Entry step defaults to the first listed step
    pub entry_step: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl DefinitionDraft {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            entry_step: None,
            steps,
        }
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry_step
            .as_deref()
            .or_else(|| self.steps.first().map(|s| s.step_id.as_str()))
    }
}

/// A frozen, published definition version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationDefinition {
    pub definition_id: Uuid,
    pub name: String,
    pub version: u32,
    /// UUIDv5 over the draft's canonical JSON; publish dedup key
    pub content_hash: Uuid,
    pub entry_step: String,
    pub steps: Vec<StepDefinition>,
    pub published_at: DateTime<Utc>,
}

impl OrchestrationDefinition {
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy_covers_recoverable_classes() {
        let policy = RetryPolicy::default();
        assert!(policy.retries(ErrorClass::Transient));
        assert!(policy.retries(ErrorClass::RateLimited));
        assert!(policy.retries(ErrorClass::DependencyFailed));
        assert!(!policy.retries(ErrorClass::NonRetryable));
        assert!(!policy.retries(ErrorClass::CompensationRequired));
    }

    #[test]
    fn test_retry_set_restriction() {
        let policy = RetryPolicy {
            retry_on_classes: vec![ErrorClass::Transient],
            ..RetryPolicy::default()
        };
        assert!(policy.retries(ErrorClass::Transient));
        assert!(!policy.retries(ErrorClass::RateLimited));
    }

    #[test]
    fn test_success_target_defaults_to_terminal() {
        let step = StepDefinition::task("only", "noop");
        assert_eq!(step.success_target(), TransitionTarget::Succeed);

        let chained = StepDefinition::task("first", "noop").then("second");
        assert_eq!(
            chained.success_target(),
            TransitionTarget::Step("second".to_string())
        );
    }

    #[test]
    fn test_draft_entry_defaults_to_first_step() {
        let draft = DefinitionDraft::new(
            "billing",
            vec![
                StepDefinition::task("issue_invoice", "invoices").then("notify"),
                StepDefinition::task("notify", "mailer"),
            ],
        );
        assert_eq!(draft.entry(), Some("issue_invoice"));
    }
}
