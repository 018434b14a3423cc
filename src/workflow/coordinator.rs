//! Single-writer driver for one run
//!
//! Every operation builds a proposed snapshot, validates it against the
//! current one, appends its events durably and only then saves the snapshot.
//! If the process dies between the append and the save, [`RunCoordinator::resume`]
//! re-derives the state from the log.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::completion::{log_verification, verify_run, VerificationReport, CHECK_WORKFLOW_COMPLETE_EVENT};
use super::continuity::{reconcile, ReconciliationReport};
use super::events::{collect_events, Event, EventLog, EventLogError, EventSource, EventType, FileEventLog};
use super::failure_handler::{
    DispatchConfig, DispatchError, DispatchOutcome, FailureAction, FailureHandlerDispatcher, HandlerExecutor,
    PreparedDispatch, ProcessHandlerExecutor, UnavailableHandlerExecutor,
};
use super::integrity::{check_run, log_report, IntegrityReport, VerificationError};
use super::lock::RunLock;
use super::persistence::{FileSystemStateStore, PersistenceError, SnapshotReason, StateStore};
use super::plan::{PlanDefinition, PlanError};
use super::state::{validate_identifier, PhaseStatus, RunStatus, StepOutcome, StepResult, StepStatus, WorkflowRun};
use super::substitution::SubstitutionContext;
use super::transition::{TransitionValidator, ValidationResult, Violation};
use crate::config::RunwardenConfig;
use crate::observability::ledger_metrics;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("Failure dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Run already exists: {run_id}")]
    RunAlreadyExists { run_id: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} was created from plan '{expected}', not '{found}'")]
    PlanMismatch {
        run_id: String,
        expected: String,
        found: String,
    },

    #[error("Unknown step: {step_id}")]
    UnknownStep { step_id: String },

    #[error("Unknown phase: {phase}")]
    UnknownPhase { phase: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Transition rejected: {}", describe_violations(.violations))]
    TransitionRejected { violations: Vec<Violation> },

    #[error("Completion blocked: {}", describe_failed_checks(.report))]
    CompletionBlocked { report: Box<VerificationReport> },
}

fn describe_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_failed_checks(report: &VerificationReport) -> String {
    report
        .failed_checks()
        .map(|c| format!("{}: {}", c.name, c.detail))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collaborators a coordinator works against
pub struct RunEnvironment {
    store: Arc<dyn StateStore>,
    event_log: Arc<dyn EventLog>,
    primary_source: Arc<dyn EventSource>,
    extra_sources: Vec<Arc<dyn EventSource>>,
    executor: Arc<dyn HandlerExecutor>,
    dispatch: DispatchConfig,
    lock_directory: Option<PathBuf>,
}

impl RunEnvironment {
    pub fn new<L>(store: Arc<dyn StateStore>, event_log: Arc<L>, executor: Arc<dyn HandlerExecutor>) -> Self
    where
        L: EventLog + 'static,
    {
        Self {
            store,
            event_log: event_log.clone(),
            primary_source: event_log,
            extra_sources: Vec::new(),
            executor,
            dispatch: DispatchConfig::default(),
            lock_directory: None,
        }
    }

    /// File-backed store and log, process handler if one is configured
    pub fn from_config(config: &RunwardenConfig) -> Self {
        let store: Arc<dyn StateStore> = Arc::new(FileSystemStateStore::new(config.storage.store_config()));
        let event_log = Arc::new(FileEventLog::new(&config.storage.events_directory));
        let executor: Arc<dyn HandlerExecutor> = match &config.failure_handling.handler_program {
            Some(program) => Arc::new(ProcessHandlerExecutor::new(
                program.clone(),
                config.failure_handling.handler_timeout(),
            )),
            None => Arc::new(UnavailableHandlerExecutor),
        };

        Self::new(store, event_log, executor)
            .with_dispatch_config(config.failure_handling.dispatch_config())
            .with_lock_directory(&config.storage.state_directory)
    }

    /// Additional read-only source merged into integrity checks
    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.extra_sources.push(source);
        self
    }

    pub fn with_dispatch_config(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_lock_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.lock_directory = Some(directory.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn sources(&self) -> Vec<Arc<dyn EventSource>> {
        let mut sources = vec![self.primary_source.clone()];
        sources.extend(self.extra_sources.iter().cloned());
        sources
    }

    fn acquire_lock(&self, run_id: &str) -> Result<Option<RunLock>, PersistenceError> {
        self.lock_directory
            .as_deref()
            .map(|dir| RunLock::acquire(dir, run_id))
            .transpose()
    }
}

pub struct RunCoordinator {
    run: WorkflowRun,
    plan: PlanDefinition,
    env: RunEnvironment,
    validator: TransitionValidator,
    dispatcher: FailureHandlerDispatcher,
    domain_variables: BTreeMap<String, String>,
    _lock: Option<RunLock>,
}

impl RunCoordinator {
    /// Create and persist a new pending run
    pub async fn create(
        plan: PlanDefinition,
        run_id: &str,
        work_id: Option<String>,
        env: RunEnvironment,
    ) -> Result<Self, CoordinatorError> {
        plan.validate()?;
        validate_identifier("run_id", run_id).map_err(|reason| CoordinatorError::InvalidInput { reason })?;

        let lock = env.acquire_lock(run_id)?;
        if env.store.load_run(run_id).await?.is_some() {
            return Err(CoordinatorError::RunAlreadyExists {
                run_id: run_id.to_string(),
            });
        }

        let mut run = WorkflowRun::from_plan(&plan, run_id, work_id, &env.dispatch.command_prefix);
        run.version = env.store.save_run(&run, SnapshotReason::StateTransition).await?;

        info!(
            run_id = %run_id,
            plan_id = %plan.plan_id,
            expected_steps = plan.expected_step_count(),
            "Run created"
        );
        Ok(Self::assemble(run, plan, env, lock))
    }

    /// Load a run, reconcile it against its events and persist the result
    pub async fn resume(
        run_id: &str,
        plan: PlanDefinition,
        env: RunEnvironment,
    ) -> Result<(Self, ReconciliationReport), CoordinatorError> {
        plan.validate()?;
        let lock = env.acquire_lock(run_id)?;
        let snapshot = env
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| CoordinatorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        if snapshot.plan_id != plan.plan_id {
            return Err(CoordinatorError::PlanMismatch {
                run_id: run_id.to_string(),
                expected: snapshot.plan_id,
                found: plan.plan_id,
            });
        }

        let events = collect_events(run_id, &env.sources()).await?;
        let (mut run, report) = reconcile(&snapshot, &events, env.dispatch.default_max_retries);

        if !report.is_clean() {
            let checkpoint_id = env
                .store
                .create_checkpoint(&snapshot, SnapshotReason::Reconciliation)
                .await?;
            run.version = env.store.save_run(&run, SnapshotReason::Reconciliation).await?;
            warn!(
                run_id = %run_id,
                adjustments = report.adjustments.len(),
                checkpoint_id = %checkpoint_id,
                "Run state reconciled against event log"
            );
        }

        info!(
            run_id = %run_id,
            status = %run.status,
            current_phase = ?run.current_phase,
            current_step = ?run.current_step,
            "Run resumed"
        );
        Ok((Self::assemble(run, plan, env, lock), report))
    }

    fn assemble(run: WorkflowRun, plan: PlanDefinition, env: RunEnvironment, lock: Option<RunLock>) -> Self {
        let dispatcher = FailureHandlerDispatcher::new(env.executor.clone(), env.event_log.clone())
            .with_config(env.dispatch.clone());
        Self {
            run,
            plan,
            env,
            validator: TransitionValidator::new(),
            dispatcher,
            domain_variables: BTreeMap::new(),
            _lock: lock,
        }
    }

    /// Extra `{name}` value for handler command templates
    pub fn with_domain_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.domain_variables.insert(key.into(), value.into());
        self
    }

    pub fn run(&self) -> &WorkflowRun {
        &self.run
    }

    pub fn plan(&self) -> &PlanDefinition {
        &self.plan
    }

    pub async fn start_run(&mut self) -> Result<(), CoordinatorError> {
        if self.run.status != RunStatus::Pending {
            return Err(CoordinatorError::InvalidInput {
                reason: format!("run is {}, only a pending run can start", self.run.status),
            });
        }

        let mut proposed = self.run.clone();
        proposed.status = RunStatus::InProgress;
        let (phase, step) = proposed.next_position();
        proposed.current_phase = phase;
        proposed.current_step = step;

        let event = Event::new(&self.run.run_id, EventType::WorkflowStart).with_payload(json!({
            "plan_id": self.run.plan_id,
            "work_id": self.run.work_id,
        }));
        self.commit(proposed, vec![event], SnapshotReason::StateTransition).await
    }

    pub async fn start_step(&mut self, step_id: &str) -> Result<(), CoordinatorError> {
        self.require_in_progress()?;
        let run_id = self.run.run_id.clone();
        let mut proposed = self.run.clone();
        let mut events = Vec::new();

        let phase_name = self.step_phase(step_id)?;
        let phase = proposed
            .phase_mut(&phase_name)
            .ok_or_else(|| CoordinatorError::UnknownPhase { phase: phase_name.clone() })?;
        if !phase.enabled {
            return Err(CoordinatorError::InvalidInput {
                reason: format!("phase '{}' is disabled", phase_name),
            });
        }
        if phase.status == PhaseStatus::Pending {
            phase.status = PhaseStatus::InProgress;
            events.push(Event::for_phase(&run_id, EventType::PhaseStart, &phase_name));
        }

        let step = phase
            .step_mut(step_id)
            .ok_or_else(|| CoordinatorError::UnknownStep { step_id: step_id.to_string() })?;
        match step.status {
            StepStatus::Pending => {}
            StepStatus::Retrying => step.attempt += 1,
            other => {
                return Err(CoordinatorError::InvalidInput {
                    reason: format!("step '{}' cannot start from {}", step_id, other),
                })
            }
        }
        step.status = StepStatus::InProgress;
        step.started_at = Some(Utc::now());
        step.finished_at = None;
        let attempt = step.attempt;

        events.push(
            Event::for_step(&run_id, EventType::StepStart, &phase_name, step_id)
                .with_payload(json!({ "attempt": attempt })),
        );
        proposed.current_phase = Some(phase_name);
        proposed.current_step = Some(step_id.to_string());

        self.commit(proposed, events, SnapshotReason::StateTransition).await
    }

    /// Record what the step executor reported. A failure is dispatched to the
    /// step's failure handler right away and the outcome returned.
    pub async fn record_step_result(
        &mut self,
        step_id: &str,
        result: StepResult,
    ) -> Result<Option<DispatchOutcome>, CoordinatorError> {
        self.require_in_progress()?;
        let run_id = self.run.run_id.clone();
        let phase_name = self.step_phase(step_id)?;
        let mut proposed = self.run.clone();

        let mut events = Vec::new();

        let phase = proposed
            .phase_mut(&phase_name)
            .ok_or_else(|| CoordinatorError::UnknownPhase { phase: phase_name.clone() })?;
        if phase.status == PhaseStatus::Pending {
            phase.status = PhaseStatus::InProgress;
            events.push(Event::for_phase(&run_id, EventType::PhaseStart, &phase_name));
        }
        let step = phase
            .step_mut(step_id)
            .ok_or_else(|| CoordinatorError::UnknownStep { step_id: step_id.to_string() })?;

        match step.status {
            StepStatus::Pending | StepStatus::InProgress => {}
            StepStatus::Retrying => step.attempt += 1,
            other => {
                return Err(CoordinatorError::InvalidInput {
                    reason: format!("step '{}' has no open execution (status {})", step_id, other),
                })
            }
        }

        let new_status = result.status.as_status();
        step.status = new_status;
        step.last_message = Some(result.message.clone());
        step.finished_at = Some(Utc::now());
        if result.status == StepOutcome::Failure {
            step.last_error = Some(result.error.clone().unwrap_or_else(|| result.message.clone()));
        }
        let attempt = step.attempt;
        if new_status.claims_completion() {
            phase.completed_step_ids.insert(step_id.to_string());
        }

        events.push(
            Event::for_step(&run_id, EventType::StepComplete, &phase_name, step_id).with_payload(json!({
                "status": new_status,
                "message": result.message,
                "error": result.error,
                "attempt": attempt,
            })),
        );
        self.commit(proposed, events, SnapshotReason::StateTransition).await?;

        if new_status == StepStatus::Failure {
            return self.handle_step_failure(step_id).await.map(Some);
        }
        Ok(None)
    }

    /// Run the declared failure handler of a failed step. A halting outcome
    /// marks the run `failed`.
    pub async fn handle_step_failure(&mut self, step_id: &str) -> Result<DispatchOutcome, CoordinatorError> {
        let run_id = self.run.run_id.clone();
        let step = self
            .run
            .find_step(step_id)
            .ok_or_else(|| CoordinatorError::UnknownStep { step_id: step_id.to_string() })?;
        let context = SubstitutionContext::for_failure(&self.run, step, &self.domain_variables);

        let mut proposed = self.run.clone();
        let step = proposed
            .find_step_mut(step_id)
            .ok_or_else(|| CoordinatorError::UnknownStep { step_id: step_id.to_string() })?;
        let prepared = self.dispatcher.prepare(&run_id, step, &context).await?;

        let outcome = match prepared {
            PreparedDispatch::Resolved(outcome) => {
                if outcome.action == FailureAction::Continue {
                    let (current_phase, current_step) = proposed.next_position();
                    proposed.current_phase = current_phase;
                    proposed.current_step = current_step;
                }
                self.commit(proposed, vec![], SnapshotReason::StateTransition).await?;
                outcome
            }
            PreparedDispatch::Invoke(pending) => {
                self.commit(proposed, vec![], SnapshotReason::BeforeRemediation).await?;

                let mut proposed = self.run.clone();
                let step = proposed
                    .find_step_mut(step_id)
                    .ok_or_else(|| CoordinatorError::UnknownStep { step_id: step_id.to_string() })?;
                let outcome = self.dispatcher.execute(&run_id, step, pending).await?;
                self.commit(proposed, vec![], SnapshotReason::StateTransition).await?;
                outcome
            }
        };

        if outcome.halts_workflow() {
            self.fail_run(step_id, &outcome).await?;
        }
        Ok(outcome)
    }

    async fn fail_run(&mut self, step_id: &str, outcome: &DispatchOutcome) -> Result<(), CoordinatorError> {
        let phase_name = self.step_phase(step_id)?;
        let mut proposed = self.run.clone();
        proposed.status = RunStatus::Failed;
        if let Some(phase) = proposed.phase_mut(&phase_name) {
            if phase.status == PhaseStatus::InProgress {
                phase.status = PhaseStatus::Failed;
            }
        }

        let payload = match &outcome.action {
            FailureAction::Stop { reason } => json!({ "reason": reason, "warnings": outcome.warnings }),
            FailureAction::RemediationFailed {
                original_error,
                handler_message,
            } => json!({
                "reason": "remediation_failed",
                "original_error": original_error,
                "handler_message": handler_message,
            }),
            _ => json!({}),
        };
        let event = Event::for_step(&self.run.run_id, EventType::WorkflowFailed, &phase_name, step_id)
            .with_payload(payload);

        error!(
            run_id = %self.run.run_id,
            step_id = %step_id,
            action = ?outcome.action,
            "Run halted by step failure"
        );
        self.commit(proposed, vec![event], SnapshotReason::StateTransition).await
    }

    pub async fn complete_phase(&mut self, phase_name: &str) -> Result<(), CoordinatorError> {
        self.require_in_progress()?;
        let mut proposed = self.run.clone();
        let phase = proposed
            .phase_mut(phase_name)
            .ok_or_else(|| CoordinatorError::UnknownPhase { phase: phase_name.to_string() })?;
        if !phase.enabled {
            return Err(CoordinatorError::InvalidInput {
                reason: format!("phase '{}' is disabled", phase_name),
            });
        }
        phase.status = PhaseStatus::Completed;
        let completed: Vec<String> = phase
            .steps
            .iter()
            .filter(|s| s.status.claims_completion())
            .map(|s| s.step_id.clone())
            .collect();
        phase.completed_step_ids.extend(completed.iter().cloned());

        let (current_phase, current_step) = proposed.next_position();
        proposed.current_phase = current_phase;
        proposed.current_step = current_step;

        let event = Event::for_phase(&self.run.run_id, EventType::PhaseComplete, phase_name)
            .with_payload(json!({ "completed_step_ids": completed }));
        self.commit(proposed, vec![event], SnapshotReason::StateTransition).await
    }

    pub async fn skip_phase(&mut self, phase_name: &str, reason: &str) -> Result<(), CoordinatorError> {
        self.require_in_progress()?;
        let mut proposed = self.run.clone();
        let phase = proposed
            .phase_mut(phase_name)
            .ok_or_else(|| CoordinatorError::UnknownPhase { phase: phase_name.to_string() })?;
        phase.status = PhaseStatus::Skipped;

        let (current_phase, current_step) = proposed.next_position();
        proposed.current_phase = current_phase;
        proposed.current_step = current_step;

        let event = Event::for_phase(&self.run.run_id, EventType::PhaseSkipped, phase_name)
            .with_payload(json!({ "reason": reason }));
        self.commit(proposed, vec![event], SnapshotReason::StateTransition).await
    }

    /// Mark the run completed. Every completion check other than the
    /// `workflow_complete` event must pass before that event is written, and
    /// the full verification must pass after it.
    pub async fn complete_run(&mut self) -> Result<VerificationReport, CoordinatorError> {
        self.require_in_progress()?;
        let run_id = self.run.run_id.clone();

        let events = collect_events(&run_id, &self.env.sources()).await?;
        let precheck = verify_run(&self.run, &events, Some(&self.plan));
        let blocking = precheck
            .failed_checks()
            .any(|c| c.name != CHECK_WORKFLOW_COMPLETE_EVENT);
        if blocking {
            log_verification(&precheck);
            return Err(CoordinatorError::CompletionBlocked {
                report: Box::new(precheck),
            });
        }

        let mut proposed = self.run.clone();
        proposed.status = RunStatus::Completed;
        proposed.current_phase = None;
        proposed.current_step = None;
        if let ValidationResult::Invalid { violations } = self.validator.validate(&self.run, &proposed) {
            return Err(self.reject(violations));
        }

        let event = Event::new(&run_id, EventType::WorkflowComplete).with_payload(json!({
            "claimed_steps": self.run.claimed_completed_steps(),
            "expected_steps": self.plan.expected_step_count(),
        }));
        self.env.event_log.append(&event).await?;

        let events = collect_events(&run_id, &self.env.sources()).await?;
        let report = verify_run(&self.run, &events, Some(&self.plan));
        log_verification(&report);
        if !report.passed() {
            return Err(CoordinatorError::CompletionBlocked {
                report: Box::new(report),
            });
        }

        self.env
            .store
            .create_checkpoint(&self.run, SnapshotReason::BeforeCompletion)
            .await?;
        self.commit(proposed, vec![], SnapshotReason::StateTransition).await?;
        let pruned = self.env.store.cleanup_old_checkpoints(&run_id).await?;
        info!(run_id = %run_id, version = self.run.version, pruned_checkpoints = pruned, "Run completed");
        Ok(report)
    }

    pub async fn pause(&mut self, reason: &str) -> Result<(), CoordinatorError> {
        self.change_run_status(RunStatus::Paused, EventType::WorkflowPaused, reason).await
    }

    /// Continue a paused or failed run. A failed run whose halting step is
    /// still `failure` or `remediation_failed` stays failed.
    pub async fn resume_execution(&mut self) -> Result<(), CoordinatorError> {
        if !matches!(self.run.status, RunStatus::Paused | RunStatus::Failed) {
            return Err(CoordinatorError::InvalidInput {
                reason: format!("run {} is {}, only a paused or failed run can resume", self.run.run_id, self.run.status),
            });
        }
        let halted = self.run.halted_steps();
        if self.run.status == RunStatus::Failed && !halted.is_empty() {
            return Err(CoordinatorError::InvalidInput {
                reason: format!(
                    "run {} is halted by terminal step(s): {}",
                    self.run.run_id,
                    halted.join(", ")
                ),
            });
        }
        let mut proposed = self.run.clone();
        proposed.status = RunStatus::InProgress;
        for phase in proposed.phases.iter_mut() {
            if phase.status == PhaseStatus::Failed {
                phase.status = PhaseStatus::InProgress;
            }
        }
        let (current_phase, current_step) = proposed.next_position();
        proposed.current_phase = current_phase;
        proposed.current_step = current_step;

        let event = Event::new(&self.run.run_id, EventType::WorkflowResumed)
            .with_payload(json!({ "from": self.run.status }));
        self.commit(proposed, vec![event], SnapshotReason::StateTransition).await
    }

    pub async fn cancel(&mut self, reason: &str) -> Result<(), CoordinatorError> {
        self.change_run_status(RunStatus::Cancelled, EventType::WorkflowCancelled, reason).await
    }

    async fn change_run_status(
        &mut self,
        status: RunStatus,
        event_type: EventType,
        reason: &str,
    ) -> Result<(), CoordinatorError> {
        if self.run.status == status {
            return Err(CoordinatorError::InvalidInput {
                reason: format!("run {} is already {}", self.run.run_id, status),
            });
        }
        let mut proposed = self.run.clone();
        proposed.status = status;
        let event = Event::new(&self.run.run_id, event_type).with_payload(json!({ "reason": reason }));
        self.commit(proposed, vec![event], SnapshotReason::StateTransition).await
    }

    pub async fn check_integrity(&self) -> Result<IntegrityReport, CoordinatorError> {
        let events = collect_events(&self.run.run_id, &self.env.sources()).await?;
        let report = check_run(&self.run, &events);
        log_report(&self.run.run_id, &report);
        Ok(report)
    }

    pub async fn verify(&self) -> Result<VerificationReport, CoordinatorError> {
        let events = collect_events(&self.run.run_id, &self.env.sources()).await?;
        let report = verify_run(&self.run, &events, Some(&self.plan));
        log_verification(&report);
        Ok(report)
    }

    pub async fn checkpoint(&self) -> Result<String, CoordinatorError> {
        Ok(self
            .env
            .store
            .create_checkpoint(&self.run, SnapshotReason::UserRequested)
            .await?)
    }

    fn require_in_progress(&self) -> Result<(), CoordinatorError> {
        if self.run.status != RunStatus::InProgress {
            return Err(CoordinatorError::InvalidInput {
                reason: format!("run {} is {}, not in_progress", self.run.run_id, self.run.status),
            });
        }
        Ok(())
    }

    fn step_phase(&self, step_id: &str) -> Result<String, CoordinatorError> {
        self.run
            .find_step(step_id)
            .map(|s| s.phase.clone())
            .ok_or_else(|| CoordinatorError::UnknownStep {
                step_id: step_id.to_string(),
            })
    }

    fn reject(&self, violations: Vec<Violation>) -> CoordinatorError {
        ledger_metrics().record_transition_rejected();
        for violation in &violations {
            warn!(
                run_id = %self.run.run_id,
                rule = %violation.rule,
                phase = ?violation.phase,
                step_id = ?violation.step_id,
                expected = %violation.expected,
                found = %violation.found,
                "{}",
                violation.message
            );
        }
        CoordinatorError::TransitionRejected { violations }
    }

    /// validate, append events, save snapshot, adopt
    async fn commit(
        &mut self,
        mut proposed: WorkflowRun,
        events: Vec<Event>,
        reason: SnapshotReason,
    ) -> Result<(), CoordinatorError> {
        if let ValidationResult::Invalid { violations } = self.validator.validate(&self.run, &proposed) {
            return Err(self.reject(violations));
        }
        for event in &events {
            event.validate()?;
        }

        for event in &events {
            self.env.event_log.append(event).await?;
        }

        proposed.updated_at = Utc::now();
        proposed.version = self.env.store.save_run(&proposed, reason).await?;
        ledger_metrics().record_transition_accepted();
        debug!(
            run_id = %proposed.run_id,
            version = proposed.version,
            status = %proposed.status,
            events = events.len(),
            "Transition committed"
        );
        self.run = proposed;
        Ok(())
    }
}
