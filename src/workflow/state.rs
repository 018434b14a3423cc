use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::failure_handler::{FailureKeyword, HandlerType, OnFailure};
use super::plan::PlanDefinition;

/// Lifecycle status of a whole workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Failed => "failed",
        }
    }

    /// Completed or skipped; nothing left to do in the phase
    pub fn is_finished(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step status, including the remediation sub-states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Success,
    Failure,
    Warning,
    Remediating,
    Retrying,
    RemediationFailed,
}

impl StepStatus {
    pub const ALL: [StepStatus; 8] = [
        StepStatus::Pending,
        StepStatus::InProgress,
        StepStatus::Success,
        StepStatus::Failure,
        StepStatus::Warning,
        StepStatus::Remediating,
        StepStatus::Retrying,
        StepStatus::RemediationFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Warning => "warning",
            StepStatus::Remediating => "remediating",
            StepStatus::Retrying => "retrying",
            StepStatus::RemediationFailed => "remediation_failed",
        }
    }

    /// Statuses counted by the advance limit: the step produced an outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success
                | StepStatus::Warning
                | StepStatus::Failure
                | StepStatus::RemediationFailed
        )
    }

    /// No further transition is possible from here
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Warning | StepStatus::RemediationFailed
        )
    }

    /// The step claims its work was done; such claims need a `step_complete` event
    pub fn claims_completion(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Warning)
    }

    /// Position along the forward-only graph within one execution attempt
    pub fn rank(&self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::InProgress => 1,
            StepStatus::Failure => 2,
            StepStatus::Remediating => 3,
            StepStatus::Retrying => 4,
            StepStatus::Success | StepStatus::Warning | StepStatus::RemediationFailed => 5,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Success,
    Failure,
}

/// The only thing a remediation handler is trusted to report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub status: HandlerStatus,
    pub message: String,
}

impl HandlerResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: HandlerStatus::Success,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: HandlerStatus::Failure,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == HandlerStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Warning,
}

impl StepOutcome {
    pub fn as_status(&self) -> StepStatus {
        match self {
            StepOutcome::Success => StepStatus::Success,
            StepOutcome::Failure => StepStatus::Failure,
            StepOutcome::Warning => StepStatus::Warning,
        }
    }
}

/// Self-reported result from the external step executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepOutcome,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: StepOutcome::Success,
            message: message.into(),
            error: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            status: StepOutcome::Warning,
            message: message.into(),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: StepOutcome::Failure,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

/// Audit record of remediation applied to a failed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub handler_type: HandlerType,
    pub handler_command: String,
    pub handler_invoked_at: Option<DateTime<Utc>>,
    pub handler_result: Option<HandlerResult>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl RemediationRecord {
    pub fn new(handler_type: HandlerType, handler_command: impl Into<String>, max_retries: u32) -> Self {
        Self {
            handler_type,
            handler_command: handler_command.into(),
            handler_invoked_at: None,
            handler_result: None,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn budget_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub name: String,
    pub phase: String,
    pub status: StepStatus,
    pub on_failure: OnFailure,
    /// Execution attempt, starting at 1 and bumped on every re-execution
    pub attempt: u32,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub remediation: Option<RemediationRecord>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(step_id: impl Into<String>, name: impl Into<String>, phase: impl Into<String>, on_failure: OnFailure) -> Self {
        Self {
            step_id: step_id.into(),
            name: name.into(),
            phase: phase.into(),
            status: StepStatus::Pending,
            on_failure,
            attempt: 1,
            last_message: None,
            last_error: None,
            remediation: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// A failed step whose declared handler is `continue` does not block its phase
    pub fn is_skippable_failure(&self) -> bool {
        self.status == StepStatus::Failure
            && matches!(
                self.on_failure,
                OnFailure::Keyword(FailureKeyword::Continue)
            )
    }

    /// Nothing left to do for this step as far as its phase is concerned
    pub fn is_settled(&self) -> bool {
        self.status.claims_completion() || self.is_skippable_failure()
    }

    /// Failed with nothing left to run: not excused by `continue`, or remediation exhausted
    pub fn halts_run(&self) -> bool {
        self.status == StepStatus::RemediationFailed
            || (self.status == StepStatus::Failure && !self.is_skippable_failure())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub enabled: bool,
    pub status: PhaseStatus,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub completed_step_ids: BTreeSet<String>,
}

impl Phase {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            status: PhaseStatus::Pending,
            steps: Vec::new(),
            completed_step_ids: BTreeSet::new(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Step ids that keep this phase from completing
    pub fn unsettled_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| !s.is_settled())
            .map(|s| s.step_id.clone())
            .collect()
    }
}

/// The persisted snapshot of one run; a projection of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub work_id: Option<String>,
    pub status: RunStatus,
    pub phases: Vec<Phase>,
    pub current_phase: Option<String>,
    pub current_step: Option<String>,
    /// Version of the stored snapshot this value was read from (0 = never saved)
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Build a fresh pending run from a plan. Each step's `on_failure` is
    /// classified here, once.
    pub fn from_plan(
        plan: &PlanDefinition,
        run_id: impl Into<String>,
        work_id: Option<String>,
        command_prefix: &str,
    ) -> Self {
        let now = Utc::now();
        let phases = plan
            .phases
            .iter()
            .map(|plan_phase| {
                let mut phase = Phase::new(plan_phase.name.clone(), plan_phase.enabled);
                phase.steps = plan_phase
                    .all_steps()
                    .map(|plan_step| {
                        Step::new(
                            plan_step.id.clone(),
                            plan_step.display_name(),
                            plan_phase.name.clone(),
                            OnFailure::classify(plan_step.on_failure.as_ref(), command_prefix),
                        )
                    })
                    .collect();
                phase
            })
            .collect();

        Self {
            run_id: run_id.into(),
            plan_id: plan.plan_id.clone(),
            work_id,
            status: RunStatus::Pending,
            phases,
            current_phase: None,
            current_step: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.name == name)
    }

    /// Find a step anywhere in the run. Step ids are unique per plan.
    pub fn find_step(&self, step_id: &str) -> Option<&Step> {
        self.phases.iter().find_map(|p| p.step(step_id))
    }

    pub fn find_step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.phases.iter_mut().find_map(|p| p.step_mut(step_id))
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn enabled_phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter().filter(|p| p.enabled)
    }

    /// Names of enabled phases that are neither completed nor skipped
    pub fn unfinished_enabled_phases(&self) -> Vec<String> {
        self.enabled_phases()
            .filter(|p| !p.status.is_finished())
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn claimed_completed_steps(&self) -> usize {
        self.steps().filter(|s| s.status.claims_completion()).count()
    }

    pub fn halted_steps(&self) -> Vec<String> {
        self.steps()
            .filter(|s| s.halts_run())
            .map(|s| s.step_id.clone())
            .collect()
    }

    pub fn terminal_steps(&self) -> usize {
        self.steps().filter(|s| s.status.is_terminal()).count()
    }

    /// First unfinished step in plan order among enabled, unfinished phases
    pub fn next_position(&self) -> (Option<String>, Option<String>) {
        for phase in self.enabled_phases().filter(|p| !p.status.is_finished()) {
            if let Some(step) = phase.steps.iter().find(|s| !s.is_settled()) {
                return (Some(phase.name.clone()), Some(step.step_id.clone()));
            }
            return (Some(phase.name.clone()), None);
        }
        (None, None)
    }
}

/// Reject identifiers that are empty or could escape a storage directory
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{kind} must not be empty"));
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") || value.contains('\0') {
        return Err(format!("{kind} '{value}' contains path characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::plan::{PlanDefinition, PlanPhase, PlanStep};

    fn plan() -> PlanDefinition {
        PlanDefinition {
            plan_id: "plan-1".to_string(),
            phases: vec![
                PlanPhase {
                    name: "frame".to_string(),
                    enabled: true,
                    pre_steps: vec![],
                    steps: vec![PlanStep::new("fetch")],
                    post_steps: vec![],
                },
                PlanPhase {
                    name: "build".to_string(),
                    enabled: true,
                    pre_steps: vec![PlanStep::new("prepare")],
                    steps: vec![PlanStep::new("implement")],
                    post_steps: vec![PlanStep::new("commit")],
                },
                PlanPhase {
                    name: "release".to_string(),
                    enabled: false,
                    pre_steps: vec![],
                    steps: vec![PlanStep::new("publish")],
                    post_steps: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_from_plan_orders_pre_main_post_steps() {
        let run = WorkflowRun::from_plan(&plan(), "run-1", Some("137".to_string()), "/");

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.version, 0);
        let build = run.phase("build").unwrap();
        let ids: Vec<_> = build.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["prepare", "implement", "commit"]);
        assert!(build
            .steps
            .iter()
            .all(|s| s.on_failure == OnFailure::Keyword(FailureKeyword::Stop)));
    }

    #[test]
    fn test_next_position_skips_disabled_and_finished() {
        let mut run = WorkflowRun::from_plan(&plan(), "run-1", None, "/");
        assert_eq!(
            run.next_position(),
            (Some("frame".to_string()), Some("fetch".to_string()))
        );

        run.phase_mut("frame").unwrap().status = PhaseStatus::Completed;
        run.find_step_mut("prepare").unwrap().status = StepStatus::Success;
        assert_eq!(
            run.next_position(),
            (Some("build".to_string()), Some("implement".to_string()))
        );

        run.phase_mut("build").unwrap().status = PhaseStatus::Skipped;
        assert_eq!(run.next_position(), (None, None));
    }

    #[test]
    fn test_unfinished_enabled_phases_ignores_disabled() {
        let mut run = WorkflowRun::from_plan(&plan(), "run-1", None, "/");
        run.phase_mut("frame").unwrap().status = PhaseStatus::Completed;

        assert_eq!(run.unfinished_enabled_phases(), vec!["build".to_string()]);
    }

    #[test]
    fn test_status_classes() {
        assert!(StepStatus::Failure.is_terminal());
        assert!(!StepStatus::Failure.is_final());
        assert!(StepStatus::RemediationFailed.is_final());
        assert!(StepStatus::Warning.claims_completion());
        assert!(!StepStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("run_id", "run-42").is_ok());
        assert!(validate_identifier("run_id", "").is_err());
        assert!(validate_identifier("run_id", "../etc").is_err());
        assert!(validate_identifier("run_id", "a/b").is_err());
    }
}
