// End-to-end workflow scenarios
// Drives runs through RunCoordinator against on-disk stores and checks what
// lands in the snapshot and the event log

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use runwarden::workflow::completion::{verify_run, CHECK_STEP_COUNT};
use runwarden::workflow::failure_handler::HandlerInvocationError;
use runwarden::workflow::integrity::check_run;
use runwarden::workflow::{
    Adjustment, CheckStatus, Discrepancy, Event, EventLog, EventSource, EventType, FailureAction, FileEventLog,
    FileSystemStateStore, HandlerExecutor, HandlerResult, IntegrityChecker, PhaseStatus, PlanDefinition, PlanPhase,
    PlanStep, RunCoordinator, RunEnvironment, RunStatus, StateStore, StepResult, StepStatus, StoreConfig,
    WorkflowRun,
};

/// Handler stub that records every command it is asked to run
struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    result: HandlerResult,
}

impl RecordingExecutor {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            result: HandlerResult::success("remediated"),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl HandlerExecutor for RecordingExecutor {
    async fn invoke(&self, resolved_command: &str) -> Result<HandlerResult, HandlerInvocationError> {
        self.commands.lock().unwrap().push(resolved_command.to_string());
        Ok(self.result.clone())
    }
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn store(&self) -> Arc<FileSystemStateStore> {
        Arc::new(FileSystemStateStore::new(StoreConfig {
            state_directory: self.dir.path().join("state"),
            ..StoreConfig::default()
        }))
    }

    fn event_log(&self) -> Arc<FileEventLog> {
        Arc::new(FileEventLog::new(self.dir.path().join("events")))
    }

    fn env(&self, executor: Arc<RecordingExecutor>) -> RunEnvironment {
        RunEnvironment::new(self.store(), self.event_log(), executor).with_lock_directory(self.dir.path().join("locks"))
    }
}

fn single_step_plan(on_failure: Option<serde_json::Value>) -> PlanDefinition {
    let mut step = PlanStep::new("parse");
    step.on_failure = on_failure;
    PlanDefinition {
        plan_id: "ingest".to_string(),
        phases: vec![PlanPhase {
            name: "prepare".to_string(),
            enabled: true,
            pre_steps: vec![],
            steps: vec![step],
            post_steps: vec![],
        }],
    }
}

fn flat_plan(step_count: usize) -> PlanDefinition {
    PlanDefinition {
        plan_id: "release".to_string(),
        phases: vec![PlanPhase {
            name: "ship".to_string(),
            enabled: true,
            pre_steps: vec![],
            steps: (1..=step_count).map(|i| PlanStep::new(format!("s{i}"))).collect(),
            post_steps: vec![],
        }],
    }
}

#[tokio::test]
async fn test_debug_handler_command_is_resolved_exactly() {
    let workspace = Workspace::new();
    let executor = RecordingExecutor::succeeding();
    let plan = single_step_plan(Some(json!("/debug --work-id {work_id} --error \"{error}\"")));
    let mut coordinator = RunCoordinator::create(plan, "run-137", Some("137".to_string()), workspace.env(executor.clone()))
        .await
        .unwrap();

    coordinator.start_run().await.unwrap();
    coordinator.start_step("parse").await.unwrap();
    let outcome = coordinator
        .record_step_result("parse", StepResult::failure("parse failed", "missing field"))
        .await
        .unwrap()
        .unwrap();

    let expected = "/debug --work-id 137 --error \"missing field\"";
    assert_eq!(outcome.resolved_command.as_deref(), Some(expected));
    assert_eq!(executor.commands(), vec![expected.to_string()]);

    let record = coordinator.run().find_step("parse").unwrap().remediation.clone().unwrap();
    assert_eq!(record.handler_command, expected);
    assert_eq!(record.retry_count, 1);
}

#[tokio::test]
async fn test_default_stop_fails_run_without_handler() {
    let workspace = Workspace::new();
    let executor = RecordingExecutor::succeeding();
    let mut coordinator = RunCoordinator::create(single_step_plan(None), "run-stop", None, workspace.env(executor.clone()))
        .await
        .unwrap();

    coordinator.start_run().await.unwrap();
    coordinator.start_step("parse").await.unwrap();
    let outcome = coordinator
        .record_step_result("parse", StepResult::failure("parse failed", "bad input"))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(outcome.action, FailureAction::Stop { .. }));
    assert!(executor.commands().is_empty());
    assert_eq!(coordinator.run().status, RunStatus::Failed);
    assert!(coordinator.run().find_step("parse").unwrap().remediation.is_none());

    let stored = workspace.store().load_run("run-stop").await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_ends_in_remediation_failed() {
    let workspace = Workspace::new();
    let executor = RecordingExecutor::succeeding();
    let plan = single_step_plan(Some(json!({"command": "/fix", "max_retries": 3})));
    let mut coordinator = RunCoordinator::create(plan, "run-fix", None, workspace.env(executor.clone()))
        .await
        .unwrap();
    coordinator.start_run().await.unwrap();

    for round in 1..=3u32 {
        coordinator.start_step("parse").await.unwrap();
        let outcome = coordinator
            .record_step_result("parse", StepResult::failure("still broken", "E1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome.action,
            FailureAction::RetryStep {
                retry_count: round,
                max_retries: 3
            }
        );
    }

    coordinator.start_step("parse").await.unwrap();
    let outcome = coordinator
        .record_step_result("parse", StepResult::failure("still broken", "E1"))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(outcome.action, FailureAction::RemediationFailed { .. }));
    assert_eq!(executor.commands().len(), 3);
    let step = coordinator.run().find_step("parse").unwrap();
    assert_eq!(step.status, StepStatus::RemediationFailed);
    assert_eq!(step.attempt, 4);
    assert_eq!(step.remediation.as_ref().unwrap().retry_count, 3);
    assert_eq!(coordinator.run().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_invalid_handler_is_coerced_to_stop_with_warning() {
    let workspace = Workspace::new();
    let executor = RecordingExecutor::succeeding();
    let log = workspace.event_log();
    let plan = single_step_plan(Some(json!("invalid_value")));
    let mut coordinator = RunCoordinator::create(plan, "run-invalid", None, workspace.env(executor.clone()))
        .await
        .unwrap();

    coordinator.start_run().await.unwrap();
    coordinator.start_step("parse").await.unwrap();
    let outcome = coordinator
        .record_step_result("parse", StepResult::failure("parse failed", "bad input"))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(outcome.action, FailureAction::Stop { .. }));
    assert!(!outcome.warnings.is_empty());
    assert!(executor.commands().is_empty());
    assert_eq!(coordinator.run().status, RunStatus::Failed);

    let events = log.read_events("run-invalid").await.unwrap();
    let warning = events
        .iter()
        .find(|e| e.event_type == EventType::StepHandlerWarning)
        .expect("warning event recorded");
    assert_eq!(warning.payload["raw"], json!("\"invalid_value\""));
    assert_eq!(events.last().unwrap().event_type, EventType::WorkflowFailed);
}

#[test]
fn test_more_claims_than_plan_is_flagged_as_fabrication() {
    let mut run = WorkflowRun::from_plan(&flat_plan(5), "run-5", None, "/");
    let mut events = Vec::new();
    for step in run.phases[0].steps.iter_mut() {
        step.status = StepStatus::Success;
        events.push(
            Event::for_step("run-5", EventType::StepComplete, "ship", step.step_id.clone())
                .with_payload(json!({"status": "success"})),
        );
    }
    run.phases[0].status = PhaseStatus::Completed;
    run.status = RunStatus::Completed;
    events.push(Event::for_phase("run-5", EventType::PhaseComplete, "ship"));
    events.push(Event::new("run-5", EventType::WorkflowComplete));

    let report = verify_run(&run, &events, Some(&flat_plan(4)));

    assert!(!report.passed());
    let check = report.check(CHECK_STEP_COUNT).unwrap();
    assert_eq!(check.status, CheckStatus::Fail);
    assert_eq!(check.detail, "more steps claimed (5) than expected (4) — possible fabrication");
}

#[tokio::test]
async fn test_event_ahead_of_pending_state_is_desynchronization() {
    let workspace = Workspace::new();
    let store = workspace.store();
    let log = workspace.event_log();
    let mut run = WorkflowRun::from_plan(&flat_plan(2), "run-ahead", None, "/");
    run.status = RunStatus::InProgress;
    store
        .save_run(&run, runwarden::workflow::SnapshotReason::StateTransition)
        .await
        .unwrap();
    log.append(
        &Event::for_step("run-ahead", EventType::StepComplete, "ship", "s1").with_payload(json!({"status": "success"})),
    )
    .await
    .unwrap();

    let sources: Vec<Arc<dyn EventSource>> = vec![log];
    let report = IntegrityChecker::new(store, sources).check("run-ahead").await.unwrap();

    assert_eq!(
        report.discrepancies(),
        &[Discrepancy::EventAheadOfState {
            phase: "ship".to_string(),
            step_id: "s1".to_string(),
            state_status: StepStatus::Pending,
        }]
    );
}

#[tokio::test]
async fn test_resume_adopts_logged_completion_after_crash() {
    let workspace = Workspace::new();
    let plan = flat_plan(2);
    {
        let mut coordinator = RunCoordinator::create(
            plan.clone(),
            "run-crash",
            None,
            workspace.env(RecordingExecutor::succeeding()),
        )
        .await
        .unwrap();
        coordinator.start_run().await.unwrap();
        coordinator.start_step("s1").await.unwrap();
    }

    // Event made it to the log, the snapshot save did not
    workspace
        .event_log()
        .append(
            &Event::for_step("run-crash", EventType::StepComplete, "ship", "s1")
                .with_payload(json!({"status": "success", "attempt": 1})),
        )
        .await
        .unwrap();

    let (coordinator, report) = RunCoordinator::resume("run-crash", plan, workspace.env(RecordingExecutor::succeeding()))
        .await
        .unwrap();

    assert!(!report.integrity_before.passed());
    assert!(report.integrity_after.passed());
    assert!(report
        .adjustments
        .iter()
        .any(|a| matches!(a, Adjustment::AdoptedStepCompletion { step_id, .. } if step_id == "s1")));
    assert_eq!(coordinator.run().find_step("s1").unwrap().status, StepStatus::Success);
    assert_eq!(coordinator.run().current_step.as_deref(), Some("s2"));

    let stored = workspace.store().load_run("run-crash").await.unwrap().unwrap();
    assert_eq!(stored.find_step("s1").unwrap().status, StepStatus::Success);
    assert!(check_run(&stored, &workspace.event_log().read_events("run-crash").await.unwrap()).passed());
}

#[tokio::test]
async fn test_full_run_passes_verification_and_check() {
    let workspace = Workspace::new();
    let plan = flat_plan(3);
    let mut coordinator = RunCoordinator::create(
        plan,
        "run-ok",
        None,
        workspace.env(RecordingExecutor::succeeding()),
    )
    .await
    .unwrap();

    coordinator.start_run().await.unwrap();
    for step in ["s1", "s2", "s3"] {
        coordinator.start_step(step).await.unwrap();
        coordinator
            .record_step_result(step, StepResult::success("ok"))
            .await
            .unwrap();
    }
    coordinator.complete_phase("ship").await.unwrap();
    let report = coordinator.complete_run().await.unwrap();

    assert!(report.passed());
    assert_eq!(coordinator.run().status, RunStatus::Completed);
    assert!(coordinator.check_integrity().await.unwrap().passed());
}

fn review_plan() -> PlanDefinition {
    PlanDefinition {
        plan_id: "review".to_string(),
        phases: vec![
            PlanPhase {
                name: "lint".to_string(),
                enabled: true,
                pre_steps: vec![],
                steps: vec![
                    PlanStep::new("style").with_on_failure(json!("continue")),
                    PlanStep::new("types"),
                ],
                post_steps: vec![],
            },
            PlanPhase {
                name: "merge".to_string(),
                enabled: true,
                pre_steps: vec![],
                steps: vec![PlanStep::new("land")],
                post_steps: vec![],
            },
        ],
    }
}

async fn run_step(coordinator: &mut RunCoordinator, step_id: &str, result: StepResult) {
    coordinator.start_step(step_id).await.unwrap();
    coordinator.record_step_result(step_id, result).await.unwrap();
}

#[tokio::test]
async fn test_continue_failure_is_excused_at_completion() {
    let workspace = Workspace::new();
    let executor = RecordingExecutor::succeeding();
    let mut coordinator = RunCoordinator::create(review_plan(), "run-lint", None, workspace.env(executor.clone()))
        .await
        .unwrap();
    coordinator.start_run().await.unwrap();

    coordinator.start_step("style").await.unwrap();
    let outcome = coordinator
        .record_step_result("style", StepResult::failure("style check", "12 findings"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.action, FailureAction::Continue);
    assert!(executor.commands().is_empty());

    let stored = workspace.store().load_run("run-lint").await.unwrap().unwrap();
    assert_eq!(stored.find_step("style").unwrap().status, StepStatus::Failure);
    assert_eq!(stored.current_step.as_deref(), Some("types"));

    run_step(&mut coordinator, "types", StepResult::success("typed")).await;
    coordinator.complete_phase("lint").await.unwrap();
    run_step(&mut coordinator, "land", StepResult::success("merged")).await;
    coordinator.complete_phase("merge").await.unwrap();

    let report = coordinator.complete_run().await.unwrap();
    assert!(report.passed());
    let step_count = report.check(CHECK_STEP_COUNT).unwrap();
    assert_eq!(step_count.status, CheckStatus::Pass);
    assert!(step_count.detail.contains("excused by 'continue'"));
}

#[tokio::test]
async fn test_skipped_phase_with_prior_success_completes() {
    let workspace = Workspace::new();
    let mut coordinator = RunCoordinator::create(
        review_plan(),
        "run-skip",
        None,
        workspace.env(RecordingExecutor::succeeding()),
    )
    .await
    .unwrap();
    coordinator.start_run().await.unwrap();

    run_step(&mut coordinator, "style", StepResult::success("clean")).await;
    coordinator.skip_phase("lint", "lint disabled for hotfix").await.unwrap();
    assert_eq!(coordinator.run().phase("lint").unwrap().status, PhaseStatus::Skipped);

    run_step(&mut coordinator, "land", StepResult::success("merged")).await;
    coordinator.complete_phase("merge").await.unwrap();

    let report = coordinator.complete_run().await.unwrap();
    assert!(report.passed());
    assert_eq!(coordinator.run().status, RunStatus::Completed);

    let events = workspace.event_log().read_events("run-skip").await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::PhaseSkipped));
    let stored = workspace.store().load_run("run-skip").await.unwrap().unwrap();
    assert!(check_run(&stored, &events).passed());
}
