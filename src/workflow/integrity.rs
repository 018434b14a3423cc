//! Cross-validation of state claims against the event log
//!
//! Every step claiming success (or warning) needs a `step_complete` event for
//! the same (phase, step_id); every completed phase needs a `phase_complete`
//! event; a completed run needs a `workflow_complete` event. Events that claim
//! more than the state does are reported too, since they mean the projection
//! fell behind the log.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::events::{collect_events, Event, EventEvidence, EventLogError, EventSource};
use super::persistence::{PersistenceError, StateStore};
use super::state::{PhaseStatus, RunStatus, StepStatus, WorkflowRun};
use crate::observability::{ledger_metrics, OperationTimer};

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// State claims the step finished but no completion event backs it
    MissingStepCompleteEvent {
        phase: String,
        step_id: String,
        claimed_status: StepStatus,
    },
    MissingPhaseCompleteEvent { phase: String },
    MissingWorkflowCompleteEvent,
    /// A completion event exists but the state still shows the step as not started or running
    EventAheadOfState {
        phase: String,
        step_id: String,
        state_status: StepStatus,
    },
}

impl Discrepancy {
    pub fn describe(&self) -> String {
        match self {
            Discrepancy::MissingStepCompleteEvent {
                phase,
                step_id,
                claimed_status,
            } => format!(
                "step '{}' in phase '{}' claims {} but has no step_complete event",
                step_id, phase, claimed_status
            ),
            Discrepancy::MissingPhaseCompleteEvent { phase } => {
                format!("phase '{}' claims completed but has no phase_complete event", phase)
            }
            Discrepancy::MissingWorkflowCompleteEvent => {
                "run claims completed but has no workflow_complete event".to_string()
            }
            Discrepancy::EventAheadOfState {
                phase,
                step_id,
                state_status,
            } => format!(
                "step '{}' in phase '{}' has a step_complete event but state shows {}",
                step_id, phase, state_status
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntegrityReport {
    Pass {
        validated_steps: usize,
        total_claimed_steps: usize,
    },
    Fail {
        validated_steps: usize,
        total_claimed_steps: usize,
        discrepancies: Vec<Discrepancy>,
    },
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        matches!(self, IntegrityReport::Pass { .. })
    }

    pub fn discrepancies(&self) -> &[Discrepancy] {
        match self {
            IntegrityReport::Pass { .. } => &[],
            IntegrityReport::Fail { discrepancies, .. } => discrepancies,
        }
    }
}

/// Pure check of one snapshot against a set of events
pub fn check_run(run: &WorkflowRun, events: &[Event]) -> IntegrityReport {
    let evidence = EventEvidence::from_events(events);
    let mut discrepancies = Vec::new();
    let mut validated_steps = 0;
    let mut total_claimed_steps = 0;

    for phase in &run.phases {
        for step in &phase.steps {
            let has_event = evidence.step_completed(&phase.name, &step.step_id);

            if step.status.claims_completion() {
                total_claimed_steps += 1;
                if has_event {
                    validated_steps += 1;
                } else {
                    discrepancies.push(Discrepancy::MissingStepCompleteEvent {
                        phase: phase.name.clone(),
                        step_id: step.step_id.clone(),
                        claimed_status: step.status,
                    });
                }
            } else if has_event {
                discrepancies.push(Discrepancy::EventAheadOfState {
                    phase: phase.name.clone(),
                    step_id: step.step_id.clone(),
                    state_status: step.status,
                });
            }
        }

        if phase.status == PhaseStatus::Completed && !evidence.phase_completed(&phase.name) {
            discrepancies.push(Discrepancy::MissingPhaseCompleteEvent {
                phase: phase.name.clone(),
            });
        }
    }

    if run.status == RunStatus::Completed && !evidence.workflow_completed() {
        discrepancies.push(Discrepancy::MissingWorkflowCompleteEvent);
    }

    if discrepancies.is_empty() {
        IntegrityReport::Pass {
            validated_steps,
            total_claimed_steps,
        }
    } else {
        IntegrityReport::Fail {
            validated_steps,
            total_claimed_steps,
            discrepancies,
        }
    }
}

/// Loads a run and its merged event sources, then runs [`check_run`]
pub struct IntegrityChecker {
    store: Arc<dyn StateStore>,
    sources: Vec<Arc<dyn EventSource>>,
}

impl IntegrityChecker {
    pub fn new(store: Arc<dyn StateStore>, sources: Vec<Arc<dyn EventSource>>) -> Self {
        Self { store, sources }
    }

    pub async fn check(&self, run_id: &str) -> Result<IntegrityReport, VerificationError> {
        let timer = OperationTimer::new("integrity_check");
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| VerificationError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let events = collect_events(run_id, &self.sources).await?;

        let report = check_run(&run, &events);
        log_report(run_id, &report);
        timer.finish();
        Ok(report)
    }
}

pub(crate) fn log_report(run_id: &str, report: &IntegrityReport) {
    match report {
        IntegrityReport::Pass {
            validated_steps,
            total_claimed_steps,
        } => info!(
            run_id = %run_id,
            validated_steps,
            total_claimed_steps,
            "Integrity check passed"
        ),
        IntegrityReport::Fail { discrepancies, .. } => {
            ledger_metrics().record_discrepancies(discrepancies.len());
            for discrepancy in discrepancies {
                warn!(run_id = %run_id, discrepancy = %discrepancy.describe(), "Integrity discrepancy");
            }
        }
    }
}
