//! Forward-only transition validation
//!
//! `validate` compares a proposed snapshot with the current one and returns
//! every rule the proposal breaks. Rejections are ordinary values; nothing
//! here logs, persists or fails.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::{Phase, PhaseStatus, RunStatus, Step, StepStatus, WorkflowRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationRule {
    AdvanceLimit,
    RunStatusTransition,
    StepStatusTransition,
    StepRegression,
    PhaseStatusTransition,
    CompletionPrecondition,
    StructureChanged,
    RemediationImmutable,
    CompletedStepsShrunk,
    IdentityChanged,
}

impl ViolationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationRule::AdvanceLimit => "advance_limit",
            ViolationRule::RunStatusTransition => "run_status_transition",
            ViolationRule::StepStatusTransition => "step_status_transition",
            ViolationRule::StepRegression => "step_regression",
            ViolationRule::PhaseStatusTransition => "phase_status_transition",
            ViolationRule::CompletionPrecondition => "completion_precondition",
            ViolationRule::StructureChanged => "structure_changed",
            ViolationRule::RemediationImmutable => "remediation_immutable",
            ViolationRule::CompletedStepsShrunk => "completed_steps_shrunk",
            ViolationRule::IdentityChanged => "identity_changed",
        }
    }
}

impl fmt::Display for ViolationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broken rule, with enough context to fix the state or the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: ViolationRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub expected: String,
    pub found: String,
    pub message: String,
}

impl Violation {
    fn new(rule: ViolationRule, expected: impl Into<String>, found: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule,
            phase: None,
            step_id: None,
            expected: expected.into(),
            found: found.into(),
            message: message.into(),
        }
    }

    fn in_phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    fn at_step(mut self, step: &Step) -> Self {
        self.phase = Some(step.phase.clone());
        self.step_id = Some(step.step_id.clone());
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.rule)?;
        if let Some(phase) = &self.phase {
            write!(f, " phase={}", phase)?;
        }
        if let Some(step_id) = &self.step_id {
            write!(f, " step={}", step_id)?;
        }
        write!(f, " {} (expected {}, found {})", self.message, self.expected, self.found)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationResult {
    Valid,
    Invalid { violations: Vec<Violation> },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            ValidationResult::Valid => &[],
            ValidationResult::Invalid { violations } => violations,
        }
    }
}

pub fn is_allowed_run_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    // Only in_progress, failed and completed may stay where they are.
    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Cancelled)
            | (InProgress, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Paused)
            | (InProgress, Cancelled)
            | (Paused, InProgress)
            | (Paused, Cancelled)
            | (Paused, Failed)
            | (Failed, InProgress)
            | (Failed, Failed)
            | (Completed, Completed)
    )
}

pub fn is_allowed_phase_transition(from: PhaseStatus, to: PhaseStatus) -> bool {
    use PhaseStatus::*;
    from == to
        || matches!(
            (from, to),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (Pending, Completed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (Failed, InProgress)
        )
}

/// Step edges within one attempt, plus the re-execution edges out of `retrying`
pub fn is_allowed_step_transition(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    from == to
        || matches!(
            (from, to),
            (Pending, InProgress)
                | (Pending, Success)
                | (Pending, Failure)
                | (Pending, Warning)
                | (InProgress, Success)
                | (InProgress, Failure)
                | (InProgress, Warning)
                | (Failure, Remediating)
                | (Failure, Retrying)
                | (Failure, RemediationFailed)
                | (Remediating, Retrying)
                | (Remediating, RemediationFailed)
                | (Retrying, InProgress)
                | (Retrying, Success)
                | (Retrying, Failure)
                | (Retrying, Warning)
        )
}

fn starts_new_attempt(from: StepStatus, to: StepStatus) -> bool {
    from == StepStatus::Retrying && from != to
}

#[derive(Debug, Clone)]
pub struct TransitionValidator {
    max_advance_per_update: usize,
}

impl Default for TransitionValidator {
    fn default() -> Self {
        Self {
            max_advance_per_update: 1,
        }
    }
}

impl TransitionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, current: &WorkflowRun, proposed: &WorkflowRun) -> ValidationResult {
        let mut violations = Vec::new();

        if current.run_id != proposed.run_id || current.plan_id != proposed.plan_id {
            violations.push(Violation::new(
                ViolationRule::IdentityChanged,
                format!("{}/{}", current.run_id, current.plan_id),
                format!("{}/{}", proposed.run_id, proposed.plan_id),
                "run_id and plan_id are fixed for the life of a run",
            ));
            return ValidationResult::Invalid { violations };
        }

        self.check_run_status(current, proposed, &mut violations);
        self.check_structure(current, proposed, &mut violations);

        let mut newly_terminal = Vec::new();
        for (current_phase, proposed_phase) in current.phases.iter().zip(proposed.phases.iter()) {
            if current_phase.name != proposed_phase.name {
                continue;
            }
            self.check_phase(current_phase, proposed_phase, &mut violations);

            for proposed_step in &proposed_phase.steps {
                let Some(current_step) = current_phase.step(&proposed_step.step_id) else {
                    continue;
                };
                self.check_step(current_step, proposed_step, &mut violations);

                if proposed_step.status.is_terminal() && proposed_step.status != current_step.status {
                    newly_terminal.push(proposed_step.step_id.clone());
                }
            }
        }

        if newly_terminal.len() > self.max_advance_per_update {
            violations.push(Violation::new(
                ViolationRule::AdvanceLimit,
                format!("at most {}", self.max_advance_per_update),
                format!("{} ({})", newly_terminal.len(), newly_terminal.join(", ")),
                format!(
                    "cannot advance more than {} step per update",
                    self.max_advance_per_update
                ),
            ));
        }

        if violations.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { violations }
        }
    }

    fn check_run_status(&self, current: &WorkflowRun, proposed: &WorkflowRun, violations: &mut Vec<Violation>) {
        if !is_allowed_run_transition(current.status, proposed.status) {
            violations.push(Violation::new(
                ViolationRule::RunStatusTransition,
                format!("a permitted successor of {}", current.status),
                proposed.status.to_string(),
                format!("run cannot move from {} to {}", current.status, proposed.status),
            ));
        }

        if proposed.status == RunStatus::Completed {
            let unfinished = proposed.unfinished_enabled_phases();
            if !unfinished.is_empty() {
                violations.push(Violation::new(
                    ViolationRule::CompletionPrecondition,
                    "every enabled phase completed or skipped",
                    unfinished.join(", "),
                    format!("run cannot complete with unfinished phases: {}", unfinished.join(", ")),
                ));
            }
        }
    }

    fn check_structure(&self, current: &WorkflowRun, proposed: &WorkflowRun, violations: &mut Vec<Violation>) {
        let names = |run: &WorkflowRun| run.phases.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
        let (current_names, proposed_names) = (names(current), names(proposed));
        if current_names != proposed_names {
            violations.push(Violation::new(
                ViolationRule::StructureChanged,
                current_names.join(", "),
                proposed_names.join(", "),
                "phases cannot be added, removed or reordered",
            ));
        }

        for (current_phase, proposed_phase) in current.phases.iter().zip(proposed.phases.iter()) {
            if current_phase.name != proposed_phase.name {
                continue;
            }
            let ids = |phase: &Phase| phase.steps.iter().map(|s| s.step_id.clone()).collect::<Vec<_>>();
            let (current_ids, proposed_ids) = (ids(current_phase), ids(proposed_phase));
            if current_ids != proposed_ids {
                violations.push(
                    Violation::new(
                        ViolationRule::StructureChanged,
                        current_ids.join(", "),
                        proposed_ids.join(", "),
                        "steps cannot be added, removed or reordered",
                    )
                    .in_phase(&current_phase.name),
                );
            }
            if current_phase.enabled != proposed_phase.enabled {
                violations.push(
                    Violation::new(
                        ViolationRule::StructureChanged,
                        format!("enabled={}", current_phase.enabled),
                        format!("enabled={}", proposed_phase.enabled),
                        "a phase cannot be enabled or disabled mid-run",
                    )
                    .in_phase(&current_phase.name),
                );
            }
        }
    }

    fn check_phase(&self, current: &Phase, proposed: &Phase, violations: &mut Vec<Violation>) {
        if !is_allowed_phase_transition(current.status, proposed.status) {
            violations.push(
                Violation::new(
                    ViolationRule::PhaseStatusTransition,
                    format!("a permitted successor of {}", current.status),
                    proposed.status.to_string(),
                    format!("phase cannot move from {} to {}", current.status, proposed.status),
                )
                .in_phase(&proposed.name),
            );
        }

        if proposed.status == PhaseStatus::Completed && current.status != PhaseStatus::Completed {
            let unsettled = proposed.unsettled_steps();
            if !unsettled.is_empty() {
                violations.push(
                    Violation::new(
                        ViolationRule::CompletionPrecondition,
                        "every step success, warning or a skippable failure",
                        unsettled.join(", "),
                        format!("phase cannot complete with unsettled steps: {}", unsettled.join(", ")),
                    )
                    .in_phase(&proposed.name),
                );
            }
        }

        let dropped: Vec<_> = current
            .completed_step_ids
            .difference(&proposed.completed_step_ids)
            .cloned()
            .collect();
        if !dropped.is_empty() {
            violations.push(
                Violation::new(
                    ViolationRule::CompletedStepsShrunk,
                    "a superset of the current completed steps",
                    format!("missing {}", dropped.join(", ")),
                    "completed_step_ids may only grow",
                )
                .in_phase(&proposed.name),
            );
        }
    }

    fn check_step(&self, current: &Step, proposed: &Step, violations: &mut Vec<Violation>) {
        let (from, to) = (current.status, proposed.status);
        let current_key = (current.attempt, from.rank());
        let proposed_key = (proposed.attempt, to.rank());

        if proposed_key < current_key {
            violations.push(
                Violation::new(
                    ViolationRule::StepRegression,
                    format!("at or after {} (attempt {})", from, current.attempt),
                    format!("{} (attempt {})", to, proposed.attempt),
                    format!("step cannot move backwards from {} to {}", from, to),
                )
                .at_step(proposed),
            );
        } else if !is_allowed_step_transition(from, to) {
            violations.push(
                Violation::new(
                    ViolationRule::StepStatusTransition,
                    format!("a permitted successor of {}", from),
                    to.to_string(),
                    format!("step cannot move from {} to {}", from, to),
                )
                .at_step(proposed),
            );
        } else {
            let expected_attempt = if starts_new_attempt(from, to) {
                current.attempt + 1
            } else {
                current.attempt
            };
            if proposed.attempt != expected_attempt {
                violations.push(
                    Violation::new(
                        ViolationRule::StepStatusTransition,
                        format!("attempt {}", expected_attempt),
                        format!("attempt {}", proposed.attempt),
                        format!("{} -> {} must keep attempt numbering consecutive", from, to),
                    )
                    .at_step(proposed),
                );
            }
        }

        self.check_remediation(current, proposed, violations);
    }

    fn check_remediation(&self, current: &Step, proposed: &Step, violations: &mut Vec<Violation>) {
        match (&current.remediation, &proposed.remediation) {
            (Some(before), after) if current.status.is_final() && after.as_ref() != Some(before) => {
                violations.push(
                    Violation::new(
                        ViolationRule::RemediationImmutable,
                        "unchanged remediation record",
                        "modified remediation record",
                        format!("remediation record is frozen once the step is {}", current.status),
                    )
                    .at_step(proposed),
                );
            }
            (Some(_), None) => {
                violations.push(
                    Violation::new(
                        ViolationRule::RemediationImmutable,
                        "remediation record present",
                        "none",
                        "a remediation record cannot be removed",
                    )
                    .at_step(proposed),
                );
            }
            (Some(before), Some(after)) if after.retry_count < before.retry_count => {
                violations.push(
                    Violation::new(
                        ViolationRule::RemediationImmutable,
                        format!("retry_count >= {}", before.retry_count),
                        after.retry_count.to_string(),
                        "retry_count cannot decrease",
                    )
                    .at_step(proposed),
                );
            }
            _ => {}
        }
    }
}
