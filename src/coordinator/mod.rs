//! # Execution Coordinator
//!
//! The only component that creates executions, transitions their status, and
//! appends attempt history. Workers are stateless: each dispatch claims the
//! step lease, re-reads the execution under it, runs at most one handler
//! attempt, records the outcome, and advances the frontier through the
//! definition's transition graph.
//!
//! ## Overview
//!
//! - **Creation** is idempotent per `(tenant, caller key)`: exactly one of
//!   any number of concurrent callers creates the execution, the rest read
//!   back the winner's id with no side effects.
//! - **Dispatch** is at-most-once per attempt: the concurrency guard admits
//!   one worker per `(execution_id, step_id)` at a time, redelivered jobs for
//!   already-satisfied steps short-circuit without touching the handler, and
//!   `SAFE_TO_RETRY_WITH_GUARD` steps consult the handler's completion
//!   pre-check before invoking it.
//! - **Failure handling** runs through the deterministic retry matrix: the
//!   error class and the step's declared policy decide between a scheduled
//!   retry row, a declared failure edge, compensation routing, and closing
//!   the execution as failed.
//! - **Manual operations** (approval, retries, cancel, pause, resume) are
//!   permission-gated through the configured [`Authorizer`] and audited on
//!   the event stream.

pub mod backoff;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::authz::{Action, Authorizer};
use crate::classifier::{classify, ErrorClass, HandlerError};
use crate::compensation::CompensationRouter;
use crate::config::ConductorConfig;
use crate::definition::{
    DefinitionStore, ResolvedDefinition, SafetyClass, StepDefinition, StepType, TransitionTarget,
};
use crate::error::{ConductorError, Result};
use crate::events::{Correlation, EngineEvent, EventPublisher};
use crate::lease::ConcurrencyGuard;
use crate::models::{AttemptOrigin, OrchestrationExecution, StepExecution};
use crate::registry::idempotency::{step_idempotency_key, IdempotencyRegistry, Reservation};
use crate::registry::StepHandler;
use crate::state_machine::{
    ExecutionEvent, ExecutionStateMachine, ExecutionStatus, ExecutionSubstatus, StepAttemptStatus,
};
use crate::store::{ExecutionStore, InMemoryStore, Lease, LeaseClaim};

use backoff::BackoffCalculator;

/// Request to create a new execution of a published definition version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExecutionRequest {
    pub definition_id: Uuid,
    pub definition_version: u32,
    pub tenant: String,
    /// Must be a JSON object; snapshotted at creation
    pub input: Value,
    /// Caller-supplied idempotency key, unique per tenant
    pub idempotency_key: String,
}

/// An execution together with its full append-only attempt history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionView {
    pub execution: OrchestrationExecution,
    pub history: Vec<StepExecution>,
}

impl ExecutionView {
    /// Attempt rows for one step, in attempt order
    pub fn attempts_for(&self, step_id: &str) -> Vec<&StepExecution> {
        self.history
            .iter()
            .filter(|row| row.step_id == step_id)
            .collect()
    }
}

/// What one dispatch accomplished
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// An attempt ran (or a retry was scheduled) and state moved forward
    Progressed,
    /// The step was already satisfied; no handler was invoked
    GuardShortCircuited,
    /// The frontier attempt is scheduled for a later instant
    WaitingUntil(DateTime<Utc>),
    /// The execution is halted in a non-terminal, non-working status
    Blocked(ExecutionStatus),
    /// The execution is closed
    Terminal(ExecutionStatus),
    /// Another worker holds the step lease
    AlreadyClaimed,
}

pub struct ExecutionCoordinator {
    store: Arc<dyn ExecutionStore>,
    definitions: Arc<DefinitionStore>,
    idempotency: IdempotencyRegistry,
    guard: ConcurrencyGuard,
    backoff: BackoffCalculator,
    compensation: CompensationRouter,
    publisher: EventPublisher,
    authorizer: Arc<dyn Authorizer>,
    config: ConductorConfig,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        definitions: Arc<DefinitionStore>,
        authorizer: Arc<dyn Authorizer>,
        config: ConductorConfig,
    ) -> Self {
        let publisher = EventPublisher::new(config.events.channel_capacity);
        let backoff = match config.backoff.jitter_seed {
            Some(seed) => BackoffCalculator::with_seed(config.backoff.multiplier, seed),
            None => BackoffCalculator::new(config.backoff.multiplier),
        };
        Self {
            idempotency: IdempotencyRegistry::new(Arc::clone(&store)),
            guard: ConcurrencyGuard::new(
                Arc::clone(&store),
                Duration::from_millis(config.lease.ttl_ms),
            ),
            backoff,
            compensation: CompensationRouter::new(publisher.clone()),
            publisher,
            store,
            definitions,
            authorizer,
            config,
        }
    }

    /// Coordinator over the bundled in-memory store with permissive
    /// authorization; for embedding and tests
    pub fn in_memory(definitions: Arc<DefinitionStore>) -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            definitions,
            Arc::new(crate::authz::AllowAll),
            ConductorConfig::default(),
        )
    }

    pub fn events(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.store)
    }

    /// Create an execution, or return the id of the one already created
    /// under the same `(tenant, idempotency_key)`.
    pub async fn create_execution(&self, request: CreateExecutionRequest) -> Result<Uuid> {
        let resolved = self
            .definitions
            .get(request.definition_id, request.definition_version)?;

        if !request.input.is_object() {
            return Err(ConductorError::ValidationError(
                "execution input must be a JSON object".to_string(),
            ));
        }
        if request.idempotency_key.trim().is_empty() {
            return Err(ConductorError::ValidationError(
                "idempotency_key must not be empty".to_string(),
            ));
        }
        if self
            .definitions
            .is_deprecated(request.definition_id, request.definition_version)
        {
            tracing::warn!(
                definition_id = %request.definition_id,
                version = request.definition_version,
                "creating execution against a deprecated definition version"
            );
        }

        let candidate_id = Uuid::new_v4();
        match self
            .idempotency
            .reserve(&request.tenant, &request.idempotency_key, candidate_id)
            .await?
        {
            Reservation::Existing(existing) => {
                // The winner inserts the row right after reserving the key;
                // wait until it is visible before handing the id back.
                self.await_visible(existing).await?;
                tracing::debug!(
                    execution_id = %existing,
                    tenant = %request.tenant,
                    "idempotent create resolved to existing execution"
                );
                return Ok(existing);
            }
            Reservation::Won => {}
        }

        let entry_step_id = resolved.definition.entry_step.clone();
        let entry_step = resolved
            .definition
            .step(&entry_step_id)
            .ok_or_else(|| ConductorError::StepNotFound(entry_step_id.clone()))?;

        let execution = OrchestrationExecution {
            execution_id: candidate_id,
            tenant: request.tenant,
            definition_id: request.definition_id,
            definition_version: request.definition_version,
            status: ExecutionStatus::Running,
            substatus: None,
            input: request.input,
            idempotency_key: request.idempotency_key,
            current_step: Some(entry_step_id.clone()),
            started_at: Utc::now(),
            completed_at: None,
        };
        self.store.insert_execution(execution.clone()).await?;

        let key = step_idempotency_key(&execution.tenant, candidate_id, &entry_step_id);
        let mut row =
            StepExecution::materialize(candidate_id, &entry_step_id, 1, AttemptOrigin::Entry, key);
        schedule_wait(&mut row, entry_step);
        self.store.append_step_execution(row).await?;

        tracing::info!(
            execution_id = %candidate_id,
            tenant = %execution.tenant,
            definition = %execution.definition_ref(),
            entry_step = %entry_step_id,
            "execution created"
        );
        self.publisher.publish(EngineEvent::ExecutionCreated {
            correlation: Correlation::execution(candidate_id),
            tenant: execution.tenant,
            definition_id: execution.definition_id,
            definition_version: execution.definition_version,
        });
        Ok(candidate_id)
    }

    /// Current status plus the complete, truthful attempt history
    pub async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionView> {
        let execution = self.load(execution_id).await?;
        let history = self.store.step_history(execution_id).await?;
        Ok(ExecutionView { execution, history })
    }

    /// Dispatch the execution's frontier step
    pub async fn process_next(&self, execution_id: Uuid, worker: &str) -> Result<StepOutcome> {
        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(StepOutcome::Terminal(execution.status));
        }
        if !execution.status.accepts_work() {
            return Ok(StepOutcome::Blocked(execution.status));
        }
        let step_id = execution.current_step.clone().ok_or_else(|| {
            ConductorError::InvalidState(format!(
                "running execution {execution_id} has no frontier step"
            ))
        })?;
        self.dispatch_step(execution_id, &step_id, worker).await
    }

    /// Process one delivered step job.
    ///
    /// Safe under redelivery: a job for an already-satisfied step returns
    /// [`StepOutcome::GuardShortCircuited`] without invoking any handler.
    pub async fn dispatch_step(
        &self,
        execution_id: Uuid,
        step_id: &str,
        worker: &str,
    ) -> Result<StepOutcome> {
        let execution = self.load(execution_id).await?;
        let history = self.store.step_history(execution_id).await?;
        if let Some(latest) = latest_row(&history, step_id) {
            if latest.status.satisfies_step() {
                return Ok(StepOutcome::GuardShortCircuited);
            }
        }
        if execution.status.is_terminal() {
            return Ok(StepOutcome::Terminal(execution.status));
        }
        if !execution.status.accepts_work() {
            return Ok(StepOutcome::Blocked(execution.status));
        }

        let lease = match self.guard.claim(execution_id, step_id, worker).await? {
            LeaseClaim::Acquired(lease) => lease,
            LeaseClaim::AlreadyClaimed { .. } => return Ok(StepOutcome::AlreadyClaimed),
        };

        let outcome = self.dispatch_claimed(execution_id, step_id, &lease).await;
        self.guard.release(&lease).await?;
        outcome
    }

    /// Drive the execution until it blocks or closes, sleeping through
    /// scheduled retry delays. Single-worker convenience driver.
    pub async fn run_to_completion(
        &self,
        execution_id: Uuid,
        worker: &str,
    ) -> Result<ExecutionView> {
        loop {
            match self.process_next(execution_id, worker).await? {
                StepOutcome::Progressed | StepOutcome::GuardShortCircuited => {}
                StepOutcome::AlreadyClaimed => tokio::task::yield_now().await,
                StepOutcome::WaitingUntil(at) => {
                    let now = Utc::now();
                    if at > now {
                        let delay = (at - now).to_std().unwrap_or(Duration::from_millis(1));
                        tokio::time::sleep(delay).await;
                    }
                }
                StepOutcome::Blocked(_) | StepOutcome::Terminal(_) => break,
            }
        }
        self.get_execution(execution_id).await
    }

    /// Grant the approval an execution is waiting on.
    ///
    /// Two cases resolve here: a parked `HUMAN_APPROVAL` step succeeds and
    /// the graph advances, or a pending compensation runs its declared
    /// handler exactly once and the execution closes as failed either way.
    pub async fn approve_step(
        &self,
        actor: &str,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<ExecutionStatus> {
        self.authorize(actor, Action::ApproveStep, execution_id)
            .await?;
        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(terminal_error(
                &execution,
                format!("cannot approve step '{step_id}' on a closed execution"),
            ));
        }
        if execution.status != ExecutionStatus::WaitingApproval {
            return Err(ConductorError::InvalidState(format!(
                "execution {execution_id} is {} and has no pending approval",
                execution.status
            )));
        }

        let resolved = self
            .definitions
            .get(execution.definition_id, execution.definition_version)?;
        let step = resolved
            .definition
            .step(step_id)
            .ok_or_else(|| ConductorError::StepNotFound(step_id.to_string()))?
            .clone();
        let history = self.store.step_history(execution_id).await?;
        let row = latest_row(&history, step_id).cloned().ok_or_else(|| {
            ConductorError::InvalidState(format!("step '{step_id}' has no attempt awaiting action"))
        })?;

        match row.status {
            StepAttemptStatus::AwaitingApproval => {
                let mut approved = row;
                approved.status = StepAttemptStatus::Succeeded;
                approved.result = Some(json!({ "approved_by": actor }));
                approved.finished_at = Some(Utc::now());
                self.store.update_step_execution(approved.clone()).await?;
                self.publish_attempt_finished(&approved);

                let resumed = self
                    .apply_event(execution, &ExecutionEvent::ApprovalGranted)
                    .await?;
                self.audit(actor, Action::ApproveStep, &approved, resumed.status);
                tracing::info!(
                    execution_id = %execution_id,
                    step_id,
                    actor,
                    "approval granted"
                );

                let outcome = self.advance(resumed, &resolved, &step, &approved).await?;
                Ok(match outcome {
                    StepOutcome::Terminal(status) => status,
                    _ => ExecutionStatus::Running,
                })
            }
            _ if execution.substatus == Some(ExecutionSubstatus::CompensationPending) => {
                let handler = resolved.compensation_for(step_id).ok_or_else(|| {
                    ConductorError::HandlerNotRegistered(format!(
                        "no compensation handler declared for step '{step_id}'"
                    ))
                })?;
                self.run_compensation(actor, execution, &step, &row, handler)
                    .await
            }
            other => Err(ConductorError::InvalidState(format!(
                "step '{step_id}' latest attempt is {other}; nothing to approve"
            ))),
        }
    }

    /// Manually re-attempt a step whose failure halted the execution
    pub async fn retry_step(&self, actor: &str, execution_id: Uuid, step_id: &str) -> Result<()> {
        self.authorize(actor, Action::RetryStep, execution_id)
            .await?;
        let execution = self.load(execution_id).await?;
        self.manual_retry(actor, Action::RetryStep, execution, step_id)
            .await
    }

    /// Manually re-attempt the execution from its frontier step
    pub async fn retry_execution(&self, actor: &str, execution_id: Uuid) -> Result<()> {
        self.authorize(actor, Action::RetryExecution, execution_id)
            .await?;
        let execution = self.load(execution_id).await?;
        let step_id = execution.current_step.clone().ok_or_else(|| {
            ConductorError::InvalidState(format!(
                "execution {execution_id} has no frontier step to retry"
            ))
        })?;
        self.manual_retry(actor, Action::RetryExecution, execution, &step_id)
            .await
    }

    pub async fn cancel_execution(&self, actor: &str, execution_id: Uuid) -> Result<()> {
        self.authorize(actor, Action::CancelExecution, execution_id)
            .await?;
        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(terminal_error(
                &execution,
                "cannot cancel a closed execution".to_string(),
            ));
        }
        let canceled = self.apply_event(execution, &ExecutionEvent::Cancel).await?;
        tracing::info!(execution_id = %execution_id, actor, "execution canceled");
        self.publisher.publish(EngineEvent::ExecutionCanceled {
            correlation: Correlation::execution(execution_id),
        });
        self.publisher.publish(EngineEvent::ManualAction {
            correlation: Correlation::execution(execution_id),
            actor: actor.to_string(),
            action: Action::CancelExecution.to_string(),
            resulting_status: canceled.status,
        });
        Ok(())
    }

    pub async fn pause_execution(&self, actor: &str, execution_id: Uuid) -> Result<()> {
        self.authorize(actor, Action::PauseExecution, execution_id)
            .await?;
        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(terminal_error(
                &execution,
                "cannot pause a closed execution".to_string(),
            ));
        }
        let paused = self.apply_event(execution, &ExecutionEvent::Pause).await?;
        self.publisher.publish(EngineEvent::ManualAction {
            correlation: Correlation::execution(execution_id),
            actor: actor.to_string(),
            action: Action::PauseExecution.to_string(),
            resulting_status: paused.status,
        });
        Ok(())
    }

    pub async fn resume_execution(&self, actor: &str, execution_id: Uuid) -> Result<()> {
        self.authorize(actor, Action::ResumeExecution, execution_id)
            .await?;
        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(terminal_error(
                &execution,
                "cannot resume a closed execution".to_string(),
            ));
        }
        let resumed = self.apply_event(execution, &ExecutionEvent::Resume).await?;
        self.publisher.publish(EngineEvent::ManualAction {
            correlation: Correlation::execution(execution_id),
            actor: actor.to_string(),
            action: Action::ResumeExecution.to_string(),
            resulting_status: resumed.status,
        });
        Ok(())
    }

    // ---- dispatch internals ----

    async fn dispatch_claimed(
        &self,
        execution_id: Uuid,
        step_id: &str,
        _lease: &Lease,
    ) -> Result<StepOutcome> {
        // Re-read under the lease: status or history may have moved while
        // we were contending for the claim.
        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(StepOutcome::Terminal(execution.status));
        }
        if !execution.status.accepts_work() {
            return Ok(StepOutcome::Blocked(execution.status));
        }

        let resolved = self
            .definitions
            .get(execution.definition_id, execution.definition_version)?;
        let step = resolved
            .definition
            .step(step_id)
            .ok_or_else(|| ConductorError::StepNotFound(step_id.to_string()))?
            .clone();

        let history = self.store.step_history(execution_id).await?;
        let mut row = match latest_row(&history, step_id).cloned() {
            Some(row) if row.status.satisfies_step() => {
                return Ok(StepOutcome::GuardShortCircuited);
            }
            Some(row) if row.status.is_claimable() => row,
            Some(row) if row.status == StepAttemptStatus::Running => {
                // We hold the lease, so whoever started this attempt is gone.
                // An unknown in-flight outcome on a NOT_SAFE_TO_RETRY step
                // goes to compensation; otherwise re-run the same attempt.
                if step.safety == SafetyClass::NotSafeToRetry {
                    let mut abandoned = row;
                    abandoned.status = StepAttemptStatus::Failed;
                    abandoned.error_class = Some(ErrorClass::CompensationRequired);
                    abandoned.error_summary =
                        Some("attempt abandoned with unknown outcome".to_string());
                    abandoned.finished_at = Some(Utc::now());
                    self.store.update_step_execution(abandoned.clone()).await?;
                    self.publish_attempt_finished(&abandoned);
                    let halted = self
                        .compensation
                        .route(
                            self.store.as_ref(),
                            execution,
                            &abandoned,
                            ErrorClass::CompensationRequired,
                            "attempt abandoned with unknown outcome",
                            resolved.compensation_for(step_id).is_some(),
                        )
                        .await?;
                    return Ok(outcome_for_halt(halted));
                }
                row
            }
            Some(row) if row.status == StepAttemptStatus::AwaitingApproval => {
                return Ok(StepOutcome::Blocked(ExecutionStatus::WaitingApproval));
            }
            Some(row) => {
                return Err(ConductorError::InvalidState(format!(
                    "step '{step_id}' frontier row is {} with no open attempt",
                    row.status
                )));
            }
            None => {
                // Crash window between the frontier move and the row append
                let attempt = next_attempt_number(&history, step_id);
                let key = step_idempotency_key(&execution.tenant, execution_id, step_id);
                let mut fresh = StepExecution::materialize(
                    execution_id,
                    step_id,
                    attempt,
                    AttemptOrigin::Entry,
                    key,
                );
                schedule_wait(&mut fresh, &step);
                self.store.append_step_execution(fresh.clone()).await?;
                fresh
            }
        };

        let now = Utc::now();
        if let Some(at) = row.retry_after_at {
            if now < at {
                return Ok(StepOutcome::WaitingUntil(at));
            }
        }

        row.status = StepAttemptStatus::Running;
        row.started_at = Some(now);
        self.store.update_step_execution(row.clone()).await?;
        self.publisher.publish(EngineEvent::StepAttemptStarted {
            correlation: step_correlation(&row),
            attempt_number: row.attempt_number,
        });

        match step.step_type {
            StepType::Wait => {
                let result = json!({ "waited_ms": step.wait_ms.unwrap_or(0) });
                self.close_success(execution, &resolved, &step, row, result)
                    .await
            }
            StepType::HumanApproval => {
                row.status = StepAttemptStatus::AwaitingApproval;
                self.store.update_step_execution(row.clone()).await?;
                let parked = self
                    .apply_event(execution, &ExecutionEvent::AwaitApproval)
                    .await?;
                self.publisher.publish(EngineEvent::ApprovalRequested {
                    correlation: step_correlation(&row),
                });
                tracing::info!(
                    execution_id = %execution_id,
                    step_id,
                    "execution parked awaiting approval"
                );
                Ok(StepOutcome::Blocked(parked.status))
            }
            _ => self.invoke_handler(execution, &resolved, step, row).await,
        }
    }

    async fn invoke_handler(
        &self,
        execution: OrchestrationExecution,
        resolved: &ResolvedDefinition,
        step: StepDefinition,
        mut row: StepExecution,
    ) -> Result<StepOutcome> {
        let handler = resolved.handler_for(&step.step_id).ok_or_else(|| {
            ConductorError::HandlerNotRegistered(
                step.handler.clone().unwrap_or_else(|| step.step_id.clone()),
            )
        })?;

        if step.safety == SafetyClass::SafeToRetryWithGuard {
            match handler.check_completed(row.idempotency_key).await {
                Ok(Some(prior)) => {
                    tracing::info!(
                        execution_id = %execution.execution_id,
                        step_id = %step.step_id,
                        attempt = row.attempt_number,
                        "guard pre-check confirmed prior completion; skipping handler"
                    );
                    row.status = StepAttemptStatus::Skipped;
                    row.result = Some(self.bounded_result(prior));
                    row.finished_at = Some(Utc::now());
                    self.store.update_step_execution(row.clone()).await?;
                    self.publish_attempt_finished(&row);
                    return self.advance(execution, resolved, &step, &row).await;
                }
                Ok(None) => {}
                Err(error) => {
                    return self
                        .handle_failure(execution, resolved, &step, row, error, false)
                        .await;
                }
            }
        }

        let timeout = Duration::from_millis(if step.timeout_ms > 0 {
            step.timeout_ms
        } else {
            self.config.execution.default_timeout_ms
        });
        match tokio::time::timeout(timeout, handler.handle(row.idempotency_key, &execution.input))
            .await
        {
            Ok(Ok(result)) => {
                self.close_success(execution, resolved, &step, row, result)
                    .await
            }
            Ok(Err(error)) => {
                self.handle_failure(execution, resolved, &step, row, error, false)
                    .await
            }
            Err(_) => {
                let error =
                    HandlerError::timeout(format!("attempt exceeded {}ms", timeout.as_millis()));
                self.handle_failure(execution, resolved, &step, row, error, true)
                    .await
            }
        }
    }

    async fn close_success(
        &self,
        execution: OrchestrationExecution,
        resolved: &ResolvedDefinition,
        step: &StepDefinition,
        mut row: StepExecution,
        result: Value,
    ) -> Result<StepOutcome> {
        row.status = StepAttemptStatus::Succeeded;
        row.result = Some(self.bounded_result(result));
        row.finished_at = Some(Utc::now());
        self.store.update_step_execution(row.clone()).await?;
        self.publish_attempt_finished(&row);
        self.advance(execution, resolved, step, &row).await
    }

    /// Route a failed handler attempt through the retry matrix
    async fn handle_failure(
        &self,
        execution: OrchestrationExecution,
        resolved: &ResolvedDefinition,
        step: &StepDefinition,
        mut row: StepExecution,
        error: HandlerError,
        timed_out: bool,
    ) -> Result<StepOutcome> {
        let class = classify(&error, &step.classifier_overrides);
        row.error_class = Some(class);
        row.error_summary = Some(error.summary());
        row.finished_at = Some(Utc::now());

        tracing::warn!(
            execution_id = %execution.execution_id,
            step_id = %step.step_id,
            attempt = row.attempt_number,
            error_class = %class,
            timed_out,
            "step attempt failed"
        );

        let closed_status = if timed_out {
            StepAttemptStatus::TimedOut
        } else {
            StepAttemptStatus::Failed
        };

        // Unsafe to repeat: never auto-retried, whatever the policy says
        if class == ErrorClass::CompensationRequired || step.safety == SafetyClass::NotSafeToRetry {
            row.status = closed_status;
            self.store.update_step_execution(row.clone()).await?;
            self.publish_attempt_finished(&row);
            let halted = self
                .compensation
                .route(
                    self.store.as_ref(),
                    execution,
                    &row,
                    class,
                    &format!("step '{}' failed without a safe retry path", step.step_id),
                    resolved.compensation_for(&step.step_id).is_some(),
                )
                .await?;
            return Ok(outcome_for_halt(halted));
        }

        if class == ErrorClass::NonRetryable {
            row.status = closed_status;
            self.store.update_step_execution(row.clone()).await?;
            self.publish_attempt_finished(&row);
            return self
                .fail_execution(
                    execution,
                    Some(class),
                    format!("step '{}' failed with a non-retryable error", step.step_id),
                    Some(&row),
                )
                .await;
        }

        let policy = &step.retry_policy;
        if policy.retries(class) && row.attempt_number < policy.max_attempts {
            let next_attempt = row.attempt_number + 1;
            let delay = match error.retry_after {
                Some(requested) => self.backoff.server_requested(policy, requested),
                None => self.backoff.delay_for(
                    policy,
                    next_attempt,
                    row.backoff_ms.map(Duration::from_millis),
                ),
            };
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            let due_at = due_after(delay);

            row.status = if timed_out {
                StepAttemptStatus::TimedOut
            } else {
                StepAttemptStatus::Retrying
            };
            self.store.update_step_execution(row.clone()).await?;

            let mut next = StepExecution::materialize(
                execution.execution_id,
                &step.step_id,
                next_attempt,
                AttemptOrigin::AutomaticRetry,
                row.idempotency_key,
            );
            next.retry_after_at = Some(due_at);
            next.backoff_ms = Some(delay_ms);
            self.store.append_step_execution(next).await?;

            tracing::info!(
                execution_id = %execution.execution_id,
                step_id = %step.step_id,
                next_attempt,
                delay_ms,
                error_class = %class,
                "retry scheduled"
            );
            self.publisher.publish(EngineEvent::StepAttemptFinished {
                correlation: step_correlation(&row),
                attempt_number: row.attempt_number,
                status: row.status,
                error_class: Some(class),
                retry_after_at: Some(due_at),
            });
            return Ok(StepOutcome::WaitingUntil(due_at));
        }

        // Exhausted, or the class is excluded from the step's retry set
        row.status = closed_status;
        self.store.update_step_execution(row.clone()).await?;
        self.publish_attempt_finished(&row);

        let edge = if timed_out {
            step.on_timeout.clone()
        } else {
            step.on_failure.clone()
        };
        match edge {
            Some(target) => self.advance_to(execution, resolved, target).await,
            None => {
                let reason = if policy.retries(class) {
                    format!(
                        "step '{}' exhausted its {} attempts",
                        step.step_id, policy.max_attempts
                    )
                } else {
                    format!(
                        "step '{}' failed with class {class} excluded from its retry set",
                        step.step_id
                    )
                };
                self.fail_execution(execution, Some(class), reason, Some(&row))
                    .await
            }
        }
    }

    /// Pick the next transition target after a satisfied attempt
    async fn advance(
        &self,
        execution: OrchestrationExecution,
        resolved: &ResolvedDefinition,
        step: &StepDefinition,
        row: &StepExecution,
    ) -> Result<StepOutcome> {
        let target = match step.step_type {
            StepType::Decision => {
                let decision = row
                    .result
                    .as_ref()
                    .and_then(|r| r.get("decision"))
                    .and_then(|d| d.as_str());
                match decision.and_then(|d| step.routes.get(d)) {
                    Some(next) => TransitionTarget::Step(next.clone()),
                    None => {
                        // Fail closed on an undeclared route. The attempt row
                        // was closed as succeeded before routing; re-mark it so
                        // the history shows why the execution failed.
                        let label = decision.unwrap_or("<missing>").to_string();
                        let mut failed = row.clone();
                        failed.status = StepAttemptStatus::Failed;
                        failed.error_class = Some(ErrorClass::NonRetryable);
                        failed.error_summary = Some(format!("undeclared route '{label}'"));
                        failed.finished_at = Some(Utc::now());
                        self.store.update_step_execution(failed.clone()).await?;
                        self.publish_attempt_finished(&failed);
                        return self
                            .fail_execution(
                                execution,
                                Some(ErrorClass::NonRetryable),
                                format!(
                                    "decision step '{}' produced undeclared route '{label}'",
                                    step.step_id
                                ),
                                Some(&failed),
                            )
                            .await;
                    }
                }
            }
            _ => step.success_target(),
        };
        self.advance_to(execution, resolved, target).await
    }

    async fn advance_to(
        &self,
        execution: OrchestrationExecution,
        resolved: &ResolvedDefinition,
        target: TransitionTarget,
    ) -> Result<StepOutcome> {
        match target {
            TransitionTarget::Succeed => {
                let closed = self
                    .apply_event(execution, &ExecutionEvent::Complete)
                    .await?;
                tracing::info!(execution_id = %closed.execution_id, "execution succeeded");
                self.publisher.publish(EngineEvent::ExecutionSucceeded {
                    correlation: Correlation::execution(closed.execution_id),
                });
                Ok(StepOutcome::Terminal(ExecutionStatus::Succeeded))
            }
            TransitionTarget::Fail => {
                self.fail_execution(
                    execution,
                    None,
                    "step graph routed to terminal failure".to_string(),
                    None,
                )
                .await
            }
            TransitionTarget::Step(next_id) => {
                let next_step = resolved
                    .definition
                    .step(&next_id)
                    .ok_or_else(|| ConductorError::StepNotFound(next_id.clone()))?;
                let history = self.store.step_history(execution.execution_id).await?;

                // Loop bound counts graph entries, not retry attempts
                let visits = history
                    .iter()
                    .filter(|r| r.step_id == next_id && r.origin == AttemptOrigin::Entry)
                    .count() as u32;
                let bound = next_step.max_visits.unwrap_or(1);
                if visits >= bound {
                    return self
                        .fail_execution(
                            execution,
                            Some(ErrorClass::NonRetryable),
                            format!("step '{next_id}' exceeded its visit bound of {bound}"),
                            None,
                        )
                        .await;
                }

                let attempt = next_attempt_number(&history, &next_id);
                let key =
                    step_idempotency_key(&execution.tenant, execution.execution_id, &next_id);
                let mut row = StepExecution::materialize(
                    execution.execution_id,
                    &next_id,
                    attempt,
                    AttemptOrigin::Entry,
                    key,
                );
                schedule_wait(&mut row, next_step);

                let expected = execution.status;
                let mut moved = execution;
                moved.current_step = Some(next_id.clone());
                if !self.store.cas_execution(expected, moved.clone()).await? {
                    // Canceled or paused underneath us; the attempt result
                    // is already recorded.
                    let current = self.load(moved.execution_id).await?;
                    if current.status == ExecutionStatus::Running {
                        return Err(ConductorError::StateTransitionError(format!(
                            "frontier move refused on running execution {}",
                            moved.execution_id
                        )));
                    }
                    return Ok(outcome_for_halt(current.status));
                }
                self.store.append_step_execution(row).await?;
                tracing::debug!(
                    execution_id = %moved.execution_id,
                    step_id = %next_id,
                    "frontier advanced"
                );
                Ok(StepOutcome::Progressed)
            }
        }
    }

    async fn fail_execution(
        &self,
        execution: OrchestrationExecution,
        class: Option<ErrorClass>,
        reason: String,
        row: Option<&StepExecution>,
    ) -> Result<StepOutcome> {
        let execution_id = execution.execution_id;
        self.apply_event(execution, &ExecutionEvent::fail_with_error(&reason))
            .await?;
        tracing::warn!(execution_id = %execution_id, reason = %reason, "execution failed");
        let correlation = match row {
            Some(row) => step_correlation(row),
            None => Correlation::execution(execution_id),
        };
        self.publisher.publish(EngineEvent::ExecutionFailed {
            correlation,
            error_class: class,
            reason,
        });
        Ok(StepOutcome::Terminal(ExecutionStatus::Failed))
    }

    /// Run the declared compensation handler once; the execution closes as
    /// failed whether or not the handler succeeds.
    async fn run_compensation(
        &self,
        actor: &str,
        execution: OrchestrationExecution,
        step: &StepDefinition,
        failed_row: &StepExecution,
        handler: Arc<dyn StepHandler>,
    ) -> Result<ExecutionStatus> {
        let history = self.store.step_history(execution.execution_id).await?;
        let attempt = next_attempt_number(&history, &step.step_id);
        let mut row = StepExecution::materialize(
            execution.execution_id,
            &step.step_id,
            attempt,
            AttemptOrigin::Compensation,
            failed_row.idempotency_key,
        );
        row.status = StepAttemptStatus::Running;
        row.started_at = Some(Utc::now());
        self.store.append_step_execution(row.clone()).await?;
        self.publisher.publish(EngineEvent::StepAttemptStarted {
            correlation: step_correlation(&row),
            attempt_number: row.attempt_number,
        });

        let timeout = Duration::from_millis(if step.timeout_ms > 0 {
            step.timeout_ms
        } else {
            self.config.execution.default_timeout_ms
        });
        let compensated =
            match tokio::time::timeout(timeout, handler.handle(row.idempotency_key, &execution.input))
                .await
            {
                Ok(Ok(result)) => {
                    row.status = StepAttemptStatus::Succeeded;
                    row.result = Some(self.bounded_result(result));
                    true
                }
                Ok(Err(error)) => {
                    row.status = StepAttemptStatus::Failed;
                    row.error_class = Some(classify(&error, &step.classifier_overrides));
                    row.error_summary = Some(error.summary());
                    false
                }
                Err(_) => {
                    row.status = StepAttemptStatus::TimedOut;
                    row.error_class = Some(ErrorClass::Transient);
                    row.error_summary =
                        Some(format!("compensation exceeded {}ms", timeout.as_millis()));
                    false
                }
            };
        row.finished_at = Some(Utc::now());
        self.store.update_step_execution(row.clone()).await?;
        self.publish_attempt_finished(&row);

        let mut execution = execution;
        execution.substatus = Some(if compensated {
            ExecutionSubstatus::CompensationApplied
        } else {
            ExecutionSubstatus::CompensationPending
        });
        let reason = if compensated {
            format!("step '{}' compensated after approval", step.step_id)
        } else {
            format!(
                "compensation for step '{}' failed; manual follow-up required",
                step.step_id
            )
        };
        tracing::warn!(
            execution_id = %execution.execution_id,
            step_id = %step.step_id,
            compensated,
            actor,
            "compensation attempt finished"
        );
        let closed = self
            .apply_event(execution, &ExecutionEvent::fail_with_error(&reason))
            .await?;
        self.audit(actor, Action::ApproveStep, &row, closed.status);
        self.publisher.publish(EngineEvent::ExecutionFailed {
            correlation: step_correlation(&row),
            error_class: Some(ErrorClass::CompensationRequired),
            reason,
        });
        Ok(closed.status)
    }

    async fn manual_retry(
        &self,
        actor: &str,
        action: Action,
        execution: OrchestrationExecution,
        step_id: &str,
    ) -> Result<()> {
        let execution_id = execution.execution_id;
        if execution.status.is_terminal() {
            return Err(terminal_error(
                &execution,
                "terminal executions are immutable".to_string(),
            ));
        }
        if !matches!(
            execution.status,
            ExecutionStatus::WaitingApproval | ExecutionStatus::Paused
        ) {
            return Err(ConductorError::InvalidState(format!(
                "execution {execution_id} is {}; only a halted execution can be retried manually",
                execution.status
            )));
        }

        let resolved = self
            .definitions
            .get(execution.definition_id, execution.definition_version)?;
        if resolved.definition.step(step_id).is_none() {
            return Err(ConductorError::StepNotFound(step_id.to_string()));
        }
        let history = self.store.step_history(execution_id).await?;
        let row = latest_row(&history, step_id).cloned().ok_or_else(|| {
            ConductorError::InvalidState(format!("step '{step_id}' has never been attempted"))
        })?;
        if !matches!(
            row.status,
            StepAttemptStatus::Failed | StepAttemptStatus::TimedOut
        ) {
            return Err(ConductorError::InvalidState(format!(
                "step '{step_id}' latest attempt is {}; only a closed failed attempt can be retried",
                row.status
            )));
        }

        let attempt = next_attempt_number(&history, step_id);
        let fresh = StepExecution::materialize(
            execution_id,
            step_id,
            attempt,
            AttemptOrigin::ManualRetry,
            row.idempotency_key,
        );
        self.store.append_step_execution(fresh.clone()).await?;

        let event = if execution.status == ExecutionStatus::Paused {
            ExecutionEvent::Resume
        } else {
            ExecutionEvent::ApprovalGranted
        };
        let mut execution = execution;
        execution.substatus = None;
        execution.current_step = Some(step_id.to_string());
        let resumed = self.apply_event(execution, &event).await?;
        tracing::info!(
            execution_id = %execution_id,
            step_id,
            actor,
            attempt,
            "manual retry scheduled"
        );
        self.audit(actor, action, &fresh, resumed.status);
        Ok(())
    }

    // ---- shared helpers ----

    async fn load(&self, execution_id: Uuid) -> Result<OrchestrationExecution> {
        self.store
            .load_execution(execution_id)
            .await?
            .ok_or(ConductorError::ExecutionNotFound(execution_id))
    }

    async fn await_visible(&self, execution_id: Uuid) -> Result<()> {
        for _ in 0..50 {
            if self.store.load_execution(execution_id).await?.is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Err(ConductorError::StorageError(format!(
            "execution {execution_id} reserved but not yet visible"
        )))
    }

    /// Evaluate the event through the state machine and persist via CAS
    async fn apply_event(
        &self,
        mut execution: OrchestrationExecution,
        event: &ExecutionEvent,
    ) -> Result<OrchestrationExecution> {
        let expected = execution.status;
        let target = ExecutionStateMachine::target_state(expected, event)?;
        execution.status = target;
        if target.is_terminal() {
            execution.completed_at = Some(Utc::now());
            execution.current_step = None;
        }
        if !self.store.cas_execution(expected, execution.clone()).await? {
            return Err(ConductorError::StateTransitionError(format!(
                "concurrent status change on execution {} during {}",
                execution.execution_id,
                event.event_type()
            )));
        }
        Ok(execution)
    }

    async fn authorize(&self, actor: &str, action: Action, execution_id: Uuid) -> Result<()> {
        let resource = format!("execution:{execution_id}");
        let decision = self.authorizer.authorize(actor, action, &resource).await;
        if !decision.allowed {
            tracing::warn!(actor, action = %action, resource = %resource, "permission denied");
            return Err(ConductorError::PermissionDenied {
                actor: actor.to_string(),
                action: action.to_string(),
                resource,
                trace: decision.trace,
            });
        }
        Ok(())
    }

    fn audit(&self, actor: &str, action: Action, row: &StepExecution, status: ExecutionStatus) {
        self.publisher.publish(EngineEvent::ManualAction {
            correlation: step_correlation(row),
            actor: actor.to_string(),
            action: action.to_string(),
            resulting_status: status,
        });
    }

    fn publish_attempt_finished(&self, row: &StepExecution) {
        self.publisher.publish(EngineEvent::StepAttemptFinished {
            correlation: step_correlation(row),
            attempt_number: row.attempt_number,
            status: row.status,
            error_class: row.error_class,
            retry_after_at: row.retry_after_at,
        });
    }

    fn bounded_result(&self, result: Value) -> Value {
        let bytes = result.to_string().len();
        if bytes > self.config.execution.max_result_bytes {
            json!({ "truncated": true, "bytes": bytes })
        } else {
            result
        }
    }
}

fn step_correlation(row: &StepExecution) -> Correlation {
    Correlation::step(
        row.execution_id,
        row.step_id.clone(),
        row.step_execution_id,
        row.idempotency_key,
    )
}

fn latest_row<'a>(history: &'a [StepExecution], step_id: &str) -> Option<&'a StepExecution> {
    history
        .iter()
        .filter(|row| row.step_id == step_id)
        .max_by_key(|row| row.attempt_number)
}

fn next_attempt_number(history: &[StepExecution], step_id: &str) -> u32 {
    latest_row(history, step_id)
        .map(|row| row.attempt_number + 1)
        .unwrap_or(1)
}

fn schedule_wait(row: &mut StepExecution, step: &StepDefinition) {
    if step.step_type == StepType::Wait {
        if let Some(wait_ms) = step.wait_ms {
            row.retry_after_at = Some(due_after(Duration::from_millis(wait_ms)));
        }
    }
}

/// `now + delay`, saturating at the calendar bound instead of wrapping when a
/// pathological policy asks for a delay near `u64::MAX` milliseconds
fn due_after(delay: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    Utc::now()
        .checked_add_signed(ChronoDuration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn outcome_for_halt(status: ExecutionStatus) -> StepOutcome {
    if status.is_terminal() {
        StepOutcome::Terminal(status)
    } else {
        StepOutcome::Blocked(status)
    }
}

fn terminal_error(execution: &OrchestrationExecution, reason: String) -> ConductorError {
    ConductorError::TerminalExecution {
        execution_id: execution.execution_id,
        status: execution.status.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DefinitionDraft;
    use crate::registry::HandlerRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        async fn handle(
            &self,
            _idempotency_key: Uuid,
            input: &Value,
        ) -> std::result::Result<Value, HandlerError> {
            Ok(input.clone())
        }
    }

    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepHandler for Counting {
        async fn handle(
            &self,
            _idempotency_key: Uuid,
            _input: &Value,
        ) -> std::result::Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "ok": true }))
        }
    }

    fn coordinator_with(
        handlers: Vec<(&str, Arc<dyn StepHandler>)>,
        draft: DefinitionDraft,
    ) -> (ExecutionCoordinator, Uuid, u32) {
        let registry = Arc::new(HandlerRegistry::new());
        for (name, handler) in handlers {
            registry.register(name, handler);
        }
        let definitions = Arc::new(DefinitionStore::new(registry));
        let (id, version) = definitions.publish(draft).unwrap();
        (ExecutionCoordinator::in_memory(definitions), id, version)
    }

    fn request(id: Uuid, version: u32, key: &str) -> CreateExecutionRequest {
        CreateExecutionRequest {
            definition_id: id,
            definition_version: version,
            tenant: "acme".to_string(),
            input: json!({ "order": 42 }),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_happy_path_two_steps() {
        let (coordinator, id, version) = coordinator_with(
            vec![("echo", Arc::new(Echo))],
            DefinitionDraft::new(
                "pipeline",
                vec![
                    StepDefinition::task("first", "echo").then("second"),
                    StepDefinition::task("second", "echo"),
                ],
            ),
        );

        let execution_id = coordinator
            .create_execution(request(id, version, "order-42"))
            .await
            .unwrap();
        let view = coordinator
            .run_to_completion(execution_id, "worker-1")
            .await
            .unwrap();

        assert_eq!(view.execution.status, ExecutionStatus::Succeeded);
        assert!(view.execution.completed_at.is_some());
        assert!(view.execution.current_step.is_none());
        assert_eq!(view.attempts_for("first").len(), 1);
        assert_eq!(view.attempts_for("second").len(), 1);
        assert_eq!(
            view.attempts_for("first")[0].status,
            StepAttemptStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_create_rejects_non_object_input() {
        let (coordinator, id, version) = coordinator_with(
            vec![("echo", Arc::new(Echo))],
            DefinitionDraft::new("single", vec![StepDefinition::task("only", "echo")]),
        );

        let mut bad = request(id, version, "k");
        bad.input = json!([1, 2, 3]);
        assert!(matches!(
            coordinator.create_execution(bad).await,
            Err(ConductorError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_repeat_create_returns_same_execution() {
        let counting = Arc::new(Counting {
            calls: AtomicU32::new(0),
        });
        let (coordinator, id, version) = coordinator_with(
            vec![("count", counting.clone())],
            DefinitionDraft::new("single", vec![StepDefinition::task("only", "count")]),
        );

        let first = coordinator
            .create_execution(request(id, version, "same-key"))
            .await
            .unwrap();
        let second = coordinator
            .create_execution(request(id, version, "same-key"))
            .await
            .unwrap();
        assert_eq!(first, second);

        coordinator
            .run_to_completion(first, "worker-1")
            .await
            .unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redelivered_job_short_circuits() {
        let counting = Arc::new(Counting {
            calls: AtomicU32::new(0),
        });
        let (coordinator, id, version) = coordinator_with(
            vec![("count", counting.clone()), ("echo", Arc::new(Echo))],
            DefinitionDraft::new(
                "pipeline",
                vec![
                    StepDefinition::task("charge", "count").then("notify"),
                    StepDefinition::task("notify", "echo"),
                ],
            ),
        );

        let execution_id = coordinator
            .create_execution(request(id, version, "o-1"))
            .await
            .unwrap();
        let first = coordinator
            .dispatch_step(execution_id, "charge", "worker-1")
            .await
            .unwrap();
        assert_eq!(first, StepOutcome::Progressed);

        // Same job delivered again: the handler must not run a second time
        let again = coordinator
            .dispatch_step(execution_id, "charge", "worker-2")
            .await
            .unwrap();
        assert_eq!(again, StepOutcome::GuardShortCircuited);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_human_approval_parks_and_resumes() {
        let (coordinator, id, version) = coordinator_with(
            vec![("echo", Arc::new(Echo))],
            DefinitionDraft::new(
                "review",
                vec![
                    StepDefinition::human_approval("sign_off").then("finalize"),
                    StepDefinition::task("finalize", "echo"),
                ],
            ),
        );

        let execution_id = coordinator
            .create_execution(request(id, version, "r-1"))
            .await
            .unwrap();
        let outcome = coordinator
            .process_next(execution_id, "worker-1")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Blocked(ExecutionStatus::WaitingApproval)
        );

        let status = coordinator
            .approve_step("reviewer@acme", execution_id, "sign_off")
            .await
            .unwrap();
        assert_eq!(status, ExecutionStatus::Running);

        let view = coordinator
            .run_to_completion(execution_id, "worker-1")
            .await
            .unwrap();
        assert_eq!(view.execution.status, ExecutionStatus::Succeeded);
        assert_eq!(
            view.attempts_for("sign_off")[0].result,
            Some(json!({ "approved_by": "reviewer@acme" }))
        );
    }

    #[tokio::test]
    async fn test_cancel_rejected_on_terminal() {
        let (coordinator, id, version) = coordinator_with(
            vec![("echo", Arc::new(Echo))],
            DefinitionDraft::new("single", vec![StepDefinition::task("only", "echo")]),
        );

        let execution_id = coordinator
            .create_execution(request(id, version, "c-1"))
            .await
            .unwrap();
        coordinator
            .run_to_completion(execution_id, "worker-1")
            .await
            .unwrap();

        let err = coordinator
            .cancel_execution("ops@acme", execution_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::TerminalExecution { .. }));
    }
}
