//! Completion gate
//!
//! A run may only be marked `completed` after [`verify_run`] passes. The
//! report always carries all four checks so an operator sees everything that
//! is wrong at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::events::{collect_events, Event, EventEvidence, EventSource};
use super::integrity::{check_run, log_report, IntegrityReport, VerificationError};
use super::persistence::StateStore;
use super::plan::PlanDefinition;
use super::state::{PhaseStatus, WorkflowRun};
use crate::observability::OperationTimer;

pub const CHECK_INTEGRITY: &str = "integrity";
pub const CHECK_PHASE_COMPLETENESS: &str = "phase_completeness";
pub const CHECK_STEP_COUNT: &str = "step_count";
pub const CHECK_WORKFLOW_COMPLETE_EVENT: &str = "workflow_complete_event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl VerificationCheck {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub run_id: String,
    pub status: VerificationStatus,
    pub checks: Vec<VerificationCheck>,
    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.status == VerificationStatus::Pass
    }

    pub fn check(&self, name: &str) -> Option<&VerificationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &VerificationCheck> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }
}

/// Run every completion check against one snapshot and its events.
/// `plan` supplies the expected step count; without it that check is a warning.
pub fn verify_run(run: &WorkflowRun, events: &[Event], plan: Option<&PlanDefinition>) -> VerificationReport {
    let integrity = check_run(run, events);
    let checks = vec![
        integrity_check(&integrity),
        phase_completeness_check(run),
        step_count_check(run, plan),
        workflow_complete_event_check(events),
    ];

    let status = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
        VerificationStatus::Fail
    } else {
        VerificationStatus::Pass
    };

    VerificationReport {
        run_id: run.run_id.clone(),
        status,
        checks,
        verified_at: Utc::now(),
    }
}

fn integrity_check(report: &IntegrityReport) -> VerificationCheck {
    match report {
        IntegrityReport::Pass {
            validated_steps,
            total_claimed_steps,
        } => VerificationCheck::new(
            CHECK_INTEGRITY,
            CheckStatus::Pass,
            format!("{}/{} claimed steps backed by events", validated_steps, total_claimed_steps),
        ),
        IntegrityReport::Fail { discrepancies, .. } => VerificationCheck::new(
            CHECK_INTEGRITY,
            CheckStatus::Fail,
            discrepancies
                .iter()
                .map(|d| d.describe())
                .collect::<Vec<_>>()
                .join("; "),
        ),
    }
}

fn phase_completeness_check(run: &WorkflowRun) -> VerificationCheck {
    let unfinished = run.unfinished_enabled_phases();
    if unfinished.is_empty() {
        VerificationCheck::new(
            CHECK_PHASE_COMPLETENESS,
            CheckStatus::Pass,
            "all enabled phases completed or skipped",
        )
    } else {
        VerificationCheck::new(
            CHECK_PHASE_COMPLETENESS,
            CheckStatus::Fail,
            format!("incomplete phases: {}", unfinished.join(", ")),
        )
    }
}

fn step_count_check(run: &WorkflowRun, plan: Option<&PlanDefinition>) -> VerificationCheck {
    let Some(plan) = plan else {
        return VerificationCheck::new(
            CHECK_STEP_COUNT,
            CheckStatus::Warning,
            "no plan available; expected step count cannot be derived",
        );
    };
    if plan.plan_id != run.plan_id {
        return VerificationCheck::new(
            CHECK_STEP_COUNT,
            CheckStatus::Warning,
            format!(
                "plan '{}' does not match run plan '{}'; expected step count cannot be derived",
                plan.plan_id, run.plan_id
            ),
        );
    }

    // Phases skipped in state and steps that failed under `continue` are not expected to succeed.
    let mut expected = 0;
    let mut excused = 0;
    for plan_phase in plan.phases.iter().filter(|p| p.enabled) {
        let state_phase = run.phase(&plan_phase.name);
        if state_phase.is_some_and(|p| p.status == PhaseStatus::Skipped) {
            continue;
        }
        expected += plan_phase.step_count();
        if let Some(phase) = state_phase {
            excused += phase.steps.iter().filter(|s| s.is_skippable_failure()).count();
        }
    }
    let expected = expected.saturating_sub(excused);
    // Successes recorded before a phase was skipped are outside the expectation too.
    let claimed = run
        .phases
        .iter()
        .filter(|p| p.status != PhaseStatus::Skipped)
        .flat_map(|p| p.steps.iter())
        .filter(|s| s.status.claims_completion())
        .count();

    if claimed > expected {
        VerificationCheck::new(
            CHECK_STEP_COUNT,
            CheckStatus::Fail,
            format!(
                "more steps claimed ({}) than expected ({}) — possible fabrication",
                claimed, expected
            ),
        )
    } else if claimed < expected {
        VerificationCheck::new(
            CHECK_STEP_COUNT,
            CheckStatus::Fail,
            format!("fewer steps claimed ({}) than expected ({}) — incomplete", claimed, expected),
        )
    } else {
        let mut detail = format!("{} of {} expected steps claimed", claimed, expected);
        if excused > 0 {
            detail.push_str(&format!(" ({} failed step(s) excused by 'continue')", excused));
        }
        VerificationCheck::new(CHECK_STEP_COUNT, CheckStatus::Pass, detail)
    }
}

fn workflow_complete_event_check(events: &[Event]) -> VerificationCheck {
    if EventEvidence::from_events(events).workflow_completed() {
        VerificationCheck::new(
            CHECK_WORKFLOW_COMPLETE_EVENT,
            CheckStatus::Pass,
            "workflow_complete event recorded",
        )
    } else {
        VerificationCheck::new(
            CHECK_WORKFLOW_COMPLETE_EVENT,
            CheckStatus::Fail,
            "no workflow_complete event recorded",
        )
    }
}

pub struct CompletionVerifier {
    store: Arc<dyn StateStore>,
    sources: Vec<Arc<dyn EventSource>>,
    plan: Option<PlanDefinition>,
}

impl CompletionVerifier {
    pub fn new(store: Arc<dyn StateStore>, sources: Vec<Arc<dyn EventSource>>) -> Self {
        Self {
            store,
            sources,
            plan: None,
        }
    }

    pub fn with_plan(mut self, plan: PlanDefinition) -> Self {
        self.plan = Some(plan);
        self
    }

    pub async fn verify(&self, run_id: &str) -> Result<VerificationReport, VerificationError> {
        let timer = OperationTimer::new("completion_verification");
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| VerificationError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let events = collect_events(run_id, &self.sources).await?;

        log_report(run_id, &check_run(&run, &events));
        let report = verify_run(&run, &events, self.plan.as_ref());
        log_verification(&report);
        timer.finish();
        Ok(report)
    }
}

pub(crate) fn log_verification(report: &VerificationReport) {
    if report.passed() {
        info!(run_id = %report.run_id, "Completion verification passed");
        return;
    }
    for check in report.failed_checks() {
        warn!(
            run_id = %report.run_id,
            check = %check.name,
            detail = %check.detail,
            "Completion check failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::events::EventType;
    use crate::workflow::failure_handler::{FailureKeyword, OnFailure};
    use crate::workflow::plan::{PlanPhase, PlanStep};
    use crate::workflow::state::{RunStatus, StepStatus};
    use serde_json::json;

    fn plan(steps: &[&str]) -> PlanDefinition {
        PlanDefinition {
            plan_id: "plan".to_string(),
            phases: vec![PlanPhase {
                name: "build".to_string(),
                enabled: true,
                pre_steps: vec![],
                steps: steps.iter().map(|s| PlanStep::new(*s)).collect(),
                post_steps: vec![],
            }],
        }
    }

    /// A run whose every step succeeded, with matching events
    fn finished(plan: &PlanDefinition) -> (WorkflowRun, Vec<Event>) {
        let mut run = WorkflowRun::from_plan(plan, "run-1", None, "/");
        run.status = RunStatus::InProgress;
        let mut events = vec![];
        for phase in run.phases.iter_mut() {
            for step in phase.steps.iter_mut() {
                step.status = StepStatus::Success;
                phase.completed_step_ids.insert(step.step_id.clone());
                events.push(
                    Event::for_step("run-1", EventType::StepComplete, &phase.name, &step.step_id)
                        .with_payload(json!({"status": "success"})),
                );
            }
            phase.status = PhaseStatus::Completed;
            events.push(Event::for_phase("run-1", EventType::PhaseComplete, &phase.name));
        }
        events.push(Event::new("run-1", EventType::WorkflowComplete));
        (run, events)
    }

    #[test]
    fn test_all_checks_pass() {
        let plan = plan(&["a", "b"]);
        let (run, events) = finished(&plan);

        let report = verify_run(&run, &events, Some(&plan));
        assert!(report.passed(), "{:?}", report);
        assert_eq!(report.checks.len(), 4);
    }

    #[test]
    fn test_more_claims_than_plan_is_fabrication() {
        let run_plan = plan(&["a", "b", "c", "d", "e"]);
        let (run, events) = finished(&run_plan);
        let mut authoritative = plan(&["a", "b", "c", "d"]);
        authoritative.plan_id = run.plan_id.clone();

        let report = verify_run(&run, &events, Some(&authoritative));
        assert!(!report.passed());
        assert_eq!(
            report.check(CHECK_STEP_COUNT).unwrap().detail,
            "more steps claimed (5) than expected (4) — possible fabrication"
        );
    }

    #[test]
    fn test_fewer_claims_than_plan_is_incomplete() {
        let plan = plan(&["a", "b"]);
        let (mut run, events) = finished(&plan);
        run.find_step_mut("b").unwrap().status = StepStatus::InProgress;

        let report = verify_run(&run, &events, Some(&plan));
        let check = report.check(CHECK_STEP_COUNT).unwrap();
        assert_eq!(check.status, CheckStatus::Fail);
        assert!(check.detail.ends_with("incomplete"));
    }

    #[test]
    fn test_incomplete_phase_fails_regardless() {
        let plan = plan(&["a"]);
        let (mut run, events) = finished(&plan);
        run.phase_mut("build").unwrap().status = PhaseStatus::InProgress;

        let report = verify_run(&run, &events, Some(&plan));
        assert!(!report.passed());
        assert_eq!(
            report.check(CHECK_PHASE_COMPLETENESS).unwrap().detail,
            "incomplete phases: build"
        );
        assert_eq!(report.check(CHECK_INTEGRITY).unwrap().status, CheckStatus::Pass);
    }

    #[test]
    fn test_missing_plan_degrades_to_warning() {
        let plan = plan(&["a"]);
        let (run, events) = finished(&plan);

        let report = verify_run(&run, &events, None);
        assert!(report.passed());
        assert_eq!(report.check(CHECK_STEP_COUNT).unwrap().status, CheckStatus::Warning);
    }

    #[test]
    fn test_missing_workflow_complete_event_fails() {
        let plan = plan(&["a"]);
        let (run, mut events) = finished(&plan);
        events.retain(|e| e.event_type != EventType::WorkflowComplete);

        let report = verify_run(&run, &events, Some(&plan));
        assert_eq!(
            report.failed_checks().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec![CHECK_WORKFLOW_COMPLETE_EVENT]
        );
    }

    #[test]
    fn test_continue_failures_are_excused_from_count() {
        let plan = plan(&["a", "b"]);
        let (mut run, events) = finished(&plan);
        let step = run.find_step_mut("b").unwrap();
        step.status = StepStatus::Failure;
        step.on_failure = OnFailure::Keyword(FailureKeyword::Continue);

        let report = verify_run(&run, &events, Some(&plan));
        assert_eq!(report.check(CHECK_STEP_COUNT).unwrap().status, CheckStatus::Pass);
    }
}
