//! Resume-time reconciliation of the snapshot against the event log
//!
//! The coordinator appends an event before it saves the matching snapshot, so
//! after a crash the log can be ahead of the state but never legitimately
//! behind it. [`reconcile`] rebuilds the projection on that basis:
//!
//! * completions recorded in the log but not in the state are adopted
//! * success, phase or run claims with no backing event are rolled back
//! * a step caught mid-remediation takes the outcome its handler event
//!   recorded, or returns to `failure` when the handler never reported
//! * retry counts only ever move up to what the log shows
//! * `current_phase` / `current_step` are recomputed from plan order
//!
//! A run is never promoted to `completed` here; that stays behind the
//! completion gate.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::events::{Event, EventEvidence, EventType};
use super::failure_handler::{FailureKeyword, HandlerType, OnFailure};
use super::integrity::{check_run, IntegrityReport};
use super::state::{HandlerResult, PhaseStatus, RemediationRecord, RunStatus, Step, StepStatus, WorkflowRun};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    AdoptedStepCompletion {
        phase: String,
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },
    RolledBackUnbackedStep {
        phase: String,
        step_id: String,
        from: StepStatus,
    },
    ResolvedInterruptedRemediation {
        phase: String,
        step_id: String,
        to: StepStatus,
    },
    RestoredRetryCount {
        phase: String,
        step_id: String,
        from: u32,
        to: u32,
    },
    AdoptedPhaseStatus {
        phase: String,
        from: PhaseStatus,
        to: PhaseStatus,
    },
    RolledBackUnbackedPhase { phase: String },
    AdoptedRunStatus { from: RunStatus, to: RunStatus },
    RolledBackUnbackedRun,
    PositionRecomputed {
        current_phase: Option<String>,
        current_step: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id: String,
    pub adjustments: Vec<Adjustment>,
    pub integrity_before: IntegrityReport,
    pub integrity_after: IntegrityReport,
}

impl ReconciliationReport {
    /// Snapshot already matched the log
    pub fn is_clean(&self) -> bool {
        self.adjustments.is_empty()
    }
}

/// Derive the consistent run from `snapshot` and its events.
/// `default_max_retries` sizes a retry budget that has to be rebuilt from events.
pub fn reconcile(
    snapshot: &WorkflowRun,
    events: &[Event],
    default_max_retries: u32,
) -> (WorkflowRun, ReconciliationReport) {
    let evidence = EventEvidence::from_events(events);
    let integrity_before = check_run(snapshot, events);
    let mut run = snapshot.clone();
    let mut adjustments = Vec::new();

    for phase in run.phases.iter_mut() {
        for step in phase.steps.iter_mut() {
            reconcile_step(step, &evidence, default_max_retries, &mut adjustments);

            if step.status.claims_completion() {
                phase.completed_step_ids.insert(step.step_id.clone());
            } else {
                phase.completed_step_ids.remove(&step.step_id);
            }
        }

        let has_event = evidence.phase_completed(&phase.name);
        if phase.status == PhaseStatus::Completed && !has_event {
            phase.status = PhaseStatus::InProgress;
            adjustments.push(Adjustment::RolledBackUnbackedPhase {
                phase: phase.name.clone(),
            });
        } else if phase.status != PhaseStatus::Completed
            && has_event
            && phase.unsettled_steps().is_empty()
        {
            adjustments.push(Adjustment::AdoptedPhaseStatus {
                phase: phase.name.clone(),
                from: phase.status,
                to: PhaseStatus::Completed,
            });
            phase.status = PhaseStatus::Completed;
        }
    }

    reconcile_run_status(&mut run, &evidence, &mut adjustments);

    let (current_phase, current_step) = if matches!(run.status, RunStatus::Completed | RunStatus::Cancelled) {
        (None, None)
    } else {
        run.next_position()
    };
    if current_phase != run.current_phase || current_step != run.current_step {
        run.current_phase = current_phase.clone();
        run.current_step = current_step.clone();
        adjustments.push(Adjustment::PositionRecomputed {
            current_phase,
            current_step,
        });
    }

    if !adjustments.is_empty() {
        run.updated_at = Utc::now();
    }
    let integrity_after = check_run(&run, events);

    for adjustment in &adjustments {
        warn!(run_id = %run.run_id, adjustment = ?adjustment, "Reconciled state against event log");
    }
    info!(
        run_id = %run.run_id,
        adjustments = adjustments.len(),
        integrity_passed = integrity_after.passed(),
        "Reconciliation finished"
    );

    let report = ReconciliationReport {
        run_id: run.run_id.clone(),
        adjustments,
        integrity_before,
        integrity_after,
    };
    (run, report)
}

fn reconcile_step(step: &mut Step, evidence: &EventEvidence, default_max_retries: u32, adjustments: &mut Vec<Adjustment>) {
    let completion = evidence
        .step_completion_outcome(&step.phase, &step.step_id)
        .map(|outcome| if outcome == "warning" { StepStatus::Warning } else { StepStatus::Success });

    match (completion, step.status) {
        (Some(outcome), StepStatus::Pending | StepStatus::InProgress | StepStatus::Retrying) => {
            let from = step.status;
            if from == StepStatus::Retrying {
                step.attempt += 1;
            }
            step.status = outcome;
            step.finished_at.get_or_insert_with(Utc::now);
            adjustments.push(Adjustment::AdoptedStepCompletion {
                phase: step.phase.clone(),
                step_id: step.step_id.clone(),
                from,
                to: outcome,
            });
        }
        (None, status) if status.claims_completion() => {
            step.status = StepStatus::Pending;
            step.finished_at = None;
            adjustments.push(Adjustment::RolledBackUnbackedStep {
                phase: step.phase.clone(),
                step_id: step.step_id.clone(),
                from: status,
            });
        }
        _ => {}
    }

    restore_retry_count(step, evidence, default_max_retries, adjustments);

    if step.status == StepStatus::Remediating {
        resolve_interrupted_remediation(step, evidence, adjustments);
    }
}

fn restore_retry_count(step: &mut Step, evidence: &EventEvidence, default_max_retries: u32, adjustments: &mut Vec<Adjustment>) {
    let attempts = evidence.remediation_attempts(&step.phase, &step.step_id);
    let stored = step.remediation.as_ref().map_or(0, |r| r.retry_count);
    if attempts <= stored {
        return;
    }

    if step.remediation.is_none() {
        let record = match &step.on_failure {
            OnFailure::Keyword(FailureKeyword::Retry) => {
                RemediationRecord::new(HandlerType::Keyword, "retry", default_max_retries)
            }
            declared => match declared.handler_spec(default_max_retries) {
                Some(spec) => RemediationRecord::new(spec.handler_type, spec.template, spec.max_retries),
                None => return,
            },
        };
        step.remediation = Some(record);
    }
    if let Some(record) = step.remediation.as_mut() {
        record.retry_count = attempts;
    }
    adjustments.push(Adjustment::RestoredRetryCount {
        phase: step.phase.clone(),
        step_id: step.step_id.clone(),
        from: stored,
        to: attempts,
    });

    // A keyword retry whose scheduling event landed but whose state did not
    if step.status == StepStatus::Failure && step.on_failure == OnFailure::Keyword(FailureKeyword::Retry) {
        step.status = StepStatus::Retrying;
        adjustments.push(Adjustment::ResolvedInterruptedRemediation {
            phase: step.phase.clone(),
            step_id: step.step_id.clone(),
            to: StepStatus::Retrying,
        });
    }
}

fn resolve_interrupted_remediation(step: &mut Step, evidence: &EventEvidence, adjustments: &mut Vec<Adjustment>) {
    let retry_count = step.remediation.as_ref().map_or(0, |r| r.retry_count);
    let recorded = evidence
        .last_handler_invocation(&step.phase, &step.step_id)
        .filter(|payload| payload.get("retry_count").and_then(|v| v.as_u64()) == Some(u64::from(retry_count)));

    let next_status = recorded
        .and_then(|payload| payload.get("next_status"))
        .and_then(|v| serde_json::from_value::<StepStatus>(v.clone()).ok())
        .filter(|s| matches!(s, StepStatus::Retrying | StepStatus::RemediationFailed));

    let to = match next_status {
        Some(status) => {
            let result = recorded
                .and_then(|payload| payload.get("result"))
                .and_then(|v| serde_json::from_value::<HandlerResult>(v.clone()).ok());
            if let Some(record) = step.remediation.as_mut() {
                record.handler_result = result;
                record.handler_invoked_at.get_or_insert_with(Utc::now);
            }
            status
        }
        // Handler never reported; the attempt stays spent and dispatch runs again.
        None => StepStatus::Failure,
    };

    step.status = to;
    adjustments.push(Adjustment::ResolvedInterruptedRemediation {
        phase: step.phase.clone(),
        step_id: step.step_id.clone(),
        to,
    });
}

fn reconcile_run_status(run: &mut WorkflowRun, evidence: &EventEvidence, adjustments: &mut Vec<Adjustment>) {
    if run.status == RunStatus::Completed && !evidence.workflow_completed() {
        run.status = RunStatus::InProgress;
        adjustments.push(Adjustment::RolledBackUnbackedRun);
        return;
    }

    let implied = match evidence.latest_run_event() {
        Some(EventType::WorkflowStart) | Some(EventType::WorkflowResumed) => {
            matches!(run.status, RunStatus::Pending | RunStatus::Paused | RunStatus::Failed)
                .then_some(RunStatus::InProgress)
        }
        Some(EventType::WorkflowPaused) => Some(RunStatus::Paused),
        Some(EventType::WorkflowFailed) => Some(RunStatus::Failed),
        Some(EventType::WorkflowCancelled) => Some(RunStatus::Cancelled),
        _ => None,
    };

    if let Some(status) = implied.filter(|s| *s != run.status && run.status != RunStatus::Completed) {
        adjustments.push(Adjustment::AdoptedRunStatus {
            from: run.status,
            to: status,
        });
        run.status = status;
    }
}
