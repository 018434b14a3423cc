//! Failure handler classification and dispatch
//!
//! A step's `on_failure` declaration is classified exactly once, when the run
//! is built from its plan, into a tagged [`OnFailure`]. Anything that is not a
//! recognized keyword, prefixed command or structured handler becomes
//! `Invalid` and is treated as `stop`.
//!
//! Dispatch is split in two so the caller can persist the `remediating`
//! status between the steps:
//!
//! 1. [`FailureHandlerDispatcher::prepare`] decides what to do, resolves the
//!    command template, bumps the retry budget and records the start of a
//!    remediation attempt.
//! 2. [`FailureHandlerDispatcher::execute`] invokes the external handler and
//!    writes the `step_handler_invoked` audit event before the step status
//!    derived from the result is applied.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::events::{Event, EventLog, EventLogError, EventType};
use super::state::{HandlerResult, RemediationRecord, Step, StepStatus};
use super::substitution::{substitute, unresolved_placeholders, SubstitutionContext};
use crate::observability::{ledger_metrics, OperationTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKeyword {
    Stop,
    Continue,
    Retry,
}

impl FailureKeyword {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stop" => Some(FailureKeyword::Stop),
            "continue" => Some(FailureKeyword::Continue),
            "retry" => Some(FailureKeyword::Retry),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKeyword::Stop => "stop",
            FailureKeyword::Continue => "continue",
            FailureKeyword::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    Keyword,
    Command,
    Structured,
}

impl HandlerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerType::Keyword => "keyword",
            HandlerType::Command => "command",
            HandlerType::Structured => "structured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredHandler {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub retry_on_success: bool,
    pub max_retries: u32,
}

/// Declared failure behavior of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Keyword(FailureKeyword),
    Command(String),
    Structured(StructuredHandler),
    Invalid { raw: String },
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Keyword(FailureKeyword::Stop)
    }
}

/// Everything needed to resolve and invoke an external handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    pub handler_type: HandlerType,
    pub template: String,
    pub retry_on_success: bool,
    pub max_retries: u32,
}

impl OnFailure {
    /// Total classification of a raw `on_failure` value. Absent means `stop`.
    pub fn classify(value: Option<&serde_json::Value>, command_prefix: &str) -> Self {
        use serde_json::Value;

        let value = match value {
            None | Some(Value::Null) => return OnFailure::default(),
            Some(value) => value,
        };

        match value {
            Value::String(s) => {
                if let Some(keyword) = FailureKeyword::parse(s) {
                    OnFailure::Keyword(keyword)
                } else if !command_prefix.is_empty()
                    && s.starts_with(command_prefix)
                    && s.len() > command_prefix.len()
                {
                    OnFailure::Command(s.clone())
                } else {
                    OnFailure::Invalid { raw: value.to_string() }
                }
            }
            Value::Object(map) => Self::classify_structured(map)
                .unwrap_or_else(|| OnFailure::Invalid { raw: value.to_string() }),
            _ => OnFailure::Invalid { raw: value.to_string() },
        }
    }

    fn classify_structured(map: &serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        use serde_json::Value;

        let command = map.get("command")?.as_str()?.trim();
        if command.is_empty() {
            return None;
        }

        let args = match map.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(arg)) => vec![arg.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()?,
            Some(_) => return None,
        };

        let retry_on_success = match map.get("retry_on_success") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => return None,
        };

        let max_retries = match map.get("max_retries") {
            None | Some(Value::Null) => 1,
            Some(value) => {
                let n = value.as_u64().filter(|n| *n >= 1)?;
                u32::try_from(n).ok()?
            }
        };

        Some(OnFailure::Structured(StructuredHandler {
            command: command.to_string(),
            args,
            retry_on_success,
            max_retries,
        }))
    }

    /// Type recorded on a RemediationRecord; `None` for stop and invalid
    pub fn handler_type(&self) -> Option<HandlerType> {
        match self {
            OnFailure::Keyword(FailureKeyword::Stop) | OnFailure::Invalid { .. } => None,
            OnFailure::Keyword(_) => Some(HandlerType::Keyword),
            OnFailure::Command(_) => Some(HandlerType::Command),
            OnFailure::Structured(_) => Some(HandlerType::Structured),
        }
    }

    /// External handler to invoke, for command and structured declarations
    pub fn handler_spec(&self, default_max_retries: u32) -> Option<HandlerSpec> {
        match self {
            OnFailure::Command(command) => Some(HandlerSpec::command(command, default_max_retries)),
            OnFailure::Structured(handler) => Some(HandlerSpec::structured(handler)),
            _ => None,
        }
    }
}

impl HandlerSpec {
    fn command(command: &str, default_max_retries: u32) -> Self {
        Self {
            handler_type: HandlerType::Command,
            template: command.to_string(),
            retry_on_success: true,
            max_retries: default_max_retries,
        }
    }

    fn structured(handler: &StructuredHandler) -> Self {
        let mut template = handler.command.clone();
        for arg in &handler.args {
            template.push(' ');
            template.push_str(arg);
        }
        Self {
            handler_type: HandlerType::Structured,
            template,
            retry_on_success: handler.retry_on_success,
            max_retries: handler.max_retries,
        }
    }
}

/// The handler capability itself could not produce a result
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerInvocationError {
    #[error("handler unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("handler crashed: {reason}")]
    Crashed { reason: String },
    #[error("handler timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Opaque remediation capability. Only `{status, message}` is trusted.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait HandlerExecutor: Send + Sync {
    async fn invoke(&self, resolved_command: &str) -> Result<HandlerResult, HandlerInvocationError>;
}

/// Runs a configured program with the resolved command as its only argument
pub struct ProcessHandlerExecutor {
    program: String,
    timeout: Duration,
}

impl ProcessHandlerExecutor {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HandlerExecutor for ProcessHandlerExecutor {
    async fn invoke(&self, resolved_command: &str) -> Result<HandlerResult, HandlerInvocationError> {
        let child = tokio::process::Command::new(&self.program)
            .arg(resolved_command)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| HandlerInvocationError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    HandlerInvocationError::Unavailable {
                        reason: format!("program '{}' not found", self.program),
                    }
                } else {
                    HandlerInvocationError::Crashed { reason: e.to_string() }
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(0) => Ok(HandlerResult::success(if stdout.is_empty() {
                "handler completed".to_string()
            } else {
                stdout
            })),
            Some(code) => Ok(HandlerResult::failure(if stderr.is_empty() {
                format!("handler exited with status {}", code)
            } else {
                stderr
            })),
            None => Err(HandlerInvocationError::Crashed {
                reason: "handler terminated by signal".to_string(),
            }),
        }
    }
}

/// Used when no handler program is configured; every invocation is a
/// capability failure so remediation fails closed.
pub struct UnavailableHandlerExecutor;

#[async_trait]
impl HandlerExecutor for UnavailableHandlerExecutor {
    async fn invoke(&self, _resolved_command: &str) -> Result<HandlerResult, HandlerInvocationError> {
        Err(HandlerInvocationError::Unavailable {
            reason: "no handler program configured".to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub command_prefix: String,
    pub default_max_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_prefix: "/".to_string(),
            default_max_retries: 1,
        }
    }
}

/// What the caller must do next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FailureAction {
    /// Mark the run failed and halt
    Stop { reason: String },
    /// Leave the step failed and move on
    Continue,
    /// Re-execute the same step
    RetryStep { retry_count: u32, max_retries: u32 },
    /// Remediation did not yield a working step; halt with both messages
    RemediationFailed {
        original_error: String,
        handler_message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub step_id: String,
    pub action: FailureAction,
    pub handler_type: Option<HandlerType>,
    pub resolved_command: Option<String>,
    pub handler_result: Option<HandlerResult>,
    pub step_status: StepStatus,
    pub warnings: Vec<String>,
}

impl DispatchOutcome {
    fn new(step: &Step, action: FailureAction, handler_type: Option<HandlerType>) -> Self {
        Self {
            step_id: step.step_id.clone(),
            action,
            handler_type,
            resolved_command: None,
            handler_result: None,
            step_status: step.status,
            warnings: Vec::new(),
        }
    }

    pub fn halts_workflow(&self) -> bool {
        matches!(
            self.action,
            FailureAction::Stop { .. } | FailureAction::RemediationFailed { .. }
        )
    }
}

/// A handler invocation that has been resolved and recorded as started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvocation {
    pub handler_type: HandlerType,
    pub resolved_command: String,
    pub retry_on_success: bool,
    pub original_error: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreparedDispatch {
    /// Decided without calling out to a handler
    Resolved(DispatchOutcome),
    /// The step is now `remediating`; call `execute` next
    Invoke(PendingInvocation),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("Step {step_id} cannot be dispatched from status {status}: expected failure")]
    StepNotFailed { step_id: String, status: StepStatus },

    #[error("Step {step_id} is {status}, expected remediating")]
    StepNotRemediating { step_id: String, status: StepStatus },

    #[error("Step {step_id} has no remediation record")]
    MissingRemediationRecord { step_id: String },
}

pub struct FailureHandlerDispatcher {
    executor: Arc<dyn HandlerExecutor>,
    event_log: Arc<dyn EventLog>,
    config: DispatchConfig,
}

impl FailureHandlerDispatcher {
    pub fn new(executor: Arc<dyn HandlerExecutor>, event_log: Arc<dyn EventLog>) -> Self {
        Self {
            executor,
            event_log,
            config: DispatchConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Prepare and, when a handler is involved, execute in one call
    pub async fn dispatch(
        &self,
        run_id: &str,
        step: &mut Step,
        context: &SubstitutionContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        match self.prepare(run_id, step, context).await? {
            PreparedDispatch::Resolved(outcome) => Ok(outcome),
            PreparedDispatch::Invoke(pending) => self.execute(run_id, step, pending).await,
        }
    }

    pub async fn prepare(
        &self,
        run_id: &str,
        step: &mut Step,
        context: &SubstitutionContext,
    ) -> Result<PreparedDispatch, DispatchError> {
        if step.status != StepStatus::Failure {
            return Err(DispatchError::StepNotFailed {
                step_id: step.step_id.clone(),
                status: step.status,
            });
        }

        match step.on_failure.clone() {
            OnFailure::Keyword(FailureKeyword::Stop) => {
                info!(run_id = %run_id, step_id = %step.step_id, "Step failed with on_failure 'stop'");
                Ok(PreparedDispatch::Resolved(DispatchOutcome::new(
                    step,
                    FailureAction::Stop {
                        reason: format!("step '{}' failed and its handler is 'stop'", step.step_id),
                    },
                    None,
                )))
            }
            OnFailure::Invalid { raw } => {
                let warning = format!(
                    "step '{}' declares unrecognized on_failure {}; treating as 'stop'",
                    step.step_id, raw
                );
                warn!(run_id = %run_id, step_id = %step.step_id, raw = %raw, "Invalid on_failure coerced to stop");

                let event = Event::for_step(run_id, EventType::StepHandlerWarning, &step.phase, &step.step_id)
                    .with_payload(json!({
                        "raw": raw,
                        "coerced_to": "stop",
                        "message": warning,
                    }));
                self.event_log.append(&event).await?;

                let mut outcome = DispatchOutcome::new(
                    step,
                    FailureAction::Stop {
                        reason: format!("step '{}' failed; on_failure was invalid", step.step_id),
                    },
                    None,
                );
                outcome.warnings.push(warning);
                Ok(PreparedDispatch::Resolved(outcome))
            }
            OnFailure::Keyword(FailureKeyword::Continue) => {
                step.remediation
                    .get_or_insert_with(|| RemediationRecord::new(HandlerType::Keyword, "continue", 0));
                info!(run_id = %run_id, step_id = %step.step_id, "Step failed; continuing per on_failure");
                Ok(PreparedDispatch::Resolved(DispatchOutcome::new(
                    step,
                    FailureAction::Continue,
                    Some(HandlerType::Keyword),
                )))
            }
            OnFailure::Keyword(FailureKeyword::Retry) => self.prepare_keyword_retry(run_id, step).await,
            OnFailure::Command(command) => {
                let spec = HandlerSpec::command(&command, self.config.default_max_retries);
                self.prepare_invocation(run_id, step, context, spec).await
            }
            OnFailure::Structured(handler) => {
                let spec = HandlerSpec::structured(&handler);
                self.prepare_invocation(run_id, step, context, spec).await
            }
        }
    }

    async fn prepare_keyword_retry(&self, run_id: &str, step: &mut Step) -> Result<PreparedDispatch, DispatchError> {
        let default_max = self.config.default_max_retries;
        let record = step
            .remediation
            .get_or_insert_with(|| RemediationRecord::new(HandlerType::Keyword, "retry", default_max));

        if record.budget_exhausted() {
            let warning = format!(
                "retry budget exhausted after {} of {} attempts; falling back to 'stop'",
                record.retry_count, record.max_retries
            );
            warn!(run_id = %run_id, step_id = %step.step_id, "{}", warning);
            let mut outcome = DispatchOutcome::new(
                step,
                FailureAction::Stop {
                    reason: format!("step '{}' failed after exhausting retries", step.step_id),
                },
                Some(HandlerType::Keyword),
            );
            outcome.warnings.push(warning);
            return Ok(PreparedDispatch::Resolved(outcome));
        }

        record.retry_count += 1;
        let (retry_count, max_retries) = (record.retry_count, record.max_retries);

        let event = Event::for_step(run_id, EventType::StepRetryScheduled, &step.phase, &step.step_id)
            .with_payload(json!({
                "retry_count": retry_count,
                "max_retries": max_retries,
            }));
        self.event_log.append(&event).await?;

        step.status = StepStatus::Retrying;
        info!(
            run_id = %run_id,
            step_id = %step.step_id,
            retry_count,
            max_retries,
            "Step scheduled for retry"
        );
        Ok(PreparedDispatch::Resolved(DispatchOutcome::new(
            step,
            FailureAction::RetryStep {
                retry_count,
                max_retries,
            },
            Some(HandlerType::Keyword),
        )))
    }

    async fn prepare_invocation(
        &self,
        run_id: &str,
        step: &mut Step,
        context: &SubstitutionContext,
        spec: HandlerSpec,
    ) -> Result<PreparedDispatch, DispatchError> {
        let original_error = step
            .last_error
            .clone()
            .unwrap_or_else(|| "step failed without an error message".to_string());
        let record = step.remediation.get_or_insert_with(|| {
            RemediationRecord::new(spec.handler_type, spec.template.clone(), spec.max_retries)
        });

        if record.budget_exhausted() {
            let handler_message = format!(
                "handler invoked {} of {} allowed times without the step succeeding",
                record.retry_count, record.max_retries
            );
            step.status = StepStatus::RemediationFailed;
            error!(run_id = %run_id, step_id = %step.step_id, "{}", handler_message);

            let mut outcome = DispatchOutcome::new(
                step,
                FailureAction::RemediationFailed {
                    original_error,
                    handler_message,
                },
                Some(spec.handler_type),
            );
            outcome.resolved_command = step.remediation.as_ref().map(|r| r.handler_command.clone());
            return Ok(PreparedDispatch::Resolved(outcome));
        }

        let resolved_command = substitute(&spec.template, context);
        let unresolved = unresolved_placeholders(&resolved_command);
        let mut warnings = Vec::new();
        if !unresolved.is_empty() {
            let warning = format!("unresolved placeholders in handler command: {}", unresolved.join(", "));
            warn!(run_id = %run_id, step_id = %step.step_id, "{}", warning);
            warnings.push(warning);
        }

        record.retry_count += 1;
        record.handler_command = resolved_command.clone();
        let (retry_count, max_retries) = (record.retry_count, record.max_retries);

        let event = Event::for_step(run_id, EventType::StepRemediationStarted, &step.phase, &step.step_id)
            .with_payload(json!({
                "original_status": StepStatus::Failure,
                "handler_type": spec.handler_type,
                "resolved_command": resolved_command,
                "retry_count": retry_count,
                "max_retries": max_retries,
                "unresolved_placeholders": unresolved,
            }));
        self.event_log.append(&event).await?;

        step.status = StepStatus::Remediating;
        Ok(PreparedDispatch::Invoke(PendingInvocation {
            handler_type: spec.handler_type,
            resolved_command,
            retry_on_success: spec.retry_on_success,
            original_error,
            warnings,
        }))
    }

    pub async fn execute(
        &self,
        run_id: &str,
        step: &mut Step,
        pending: PendingInvocation,
    ) -> Result<DispatchOutcome, DispatchError> {
        if step.status != StepStatus::Remediating {
            return Err(DispatchError::StepNotRemediating {
                step_id: step.step_id.clone(),
                status: step.status,
            });
        }
        let (retry_count, max_retries) = match &step.remediation {
            Some(record) => (record.retry_count, record.max_retries),
            None => {
                return Err(DispatchError::MissingRemediationRecord {
                    step_id: step.step_id.clone(),
                })
            }
        };

        let timer = OperationTimer::new("handler_invocation");
        ledger_metrics().record_handler_invocation();

        let (result, capability_failed) = match self.executor.invoke(&pending.resolved_command).await {
            Ok(result) => (result, false),
            Err(e) => {
                error!(
                    run_id = %run_id,
                    step_id = %step.step_id,
                    command = %pending.resolved_command,
                    error = %e,
                    "Handler capability failed"
                );
                (HandlerResult::failure(format!("handler capability failed: {}", e)), true)
            }
        };
        if !result.is_success() {
            ledger_metrics().record_handler_failure();
        }

        let next_status = if result.is_success() && pending.retry_on_success {
            StepStatus::Retrying
        } else {
            StepStatus::RemediationFailed
        };

        // The audit record must exist before any state derived from the result.
        let event = Event::for_step(run_id, EventType::StepHandlerInvoked, &step.phase, &step.step_id)
            .with_payload(json!({
                "original_status": StepStatus::Failure,
                "handler_type": pending.handler_type,
                "resolved_command": pending.resolved_command,
                "result": result,
                "capability_failed": capability_failed,
                "retry_count": retry_count,
                "max_retries": max_retries,
                "next_status": next_status,
            }));
        self.event_log.append(&event).await?;

        if let Some(record) = step.remediation.as_mut() {
            record.handler_invoked_at = Some(Utc::now());
            record.handler_result = Some(result.clone());
        }
        step.status = next_status;

        let action = if next_status == StepStatus::Retrying {
            info!(run_id = %run_id, step_id = %step.step_id, retry_count, max_retries, "Handler succeeded; retrying step");
            FailureAction::RetryStep {
                retry_count,
                max_retries,
            }
        } else {
            let handler_message = if result.is_success() {
                format!(
                    "handler reported success but retry_on_success is disabled: {}",
                    result.message
                )
            } else {
                result.message.clone()
            };
            error!(
                run_id = %run_id,
                step_id = %step.step_id,
                original_error = %pending.original_error,
                handler_message = %handler_message,
                "Remediation failed"
            );
            FailureAction::RemediationFailed {
                original_error: pending.original_error.clone(),
                handler_message,
            }
        };

        timer.finish();

        let mut outcome = DispatchOutcome::new(step, action, Some(pending.handler_type));
        outcome.resolved_command = Some(pending.resolved_command);
        outcome.handler_result = Some(result);
        outcome.warnings = pending.warnings;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::events::{EventSource, InMemoryEventLog};
    use crate::workflow::substitution::{STEP_ID, WORK_ID};

    fn failed_step(on_failure: OnFailure) -> Step {
        let mut step = Step::new("implement", "Implement", "build", on_failure);
        step.status = StepStatus::Failure;
        step.last_error = Some("missing field".to_string());
        step
    }

    fn dispatcher(executor: MockHandlerExecutor, log: Arc<InMemoryEventLog>) -> FailureHandlerDispatcher {
        FailureHandlerDispatcher::new(Arc::new(executor), log)
    }

    #[test]
    fn test_classification_is_total() {
        let prefix = "/";
        assert_eq!(OnFailure::classify(None, prefix), OnFailure::Keyword(FailureKeyword::Stop));
        assert_eq!(
            OnFailure::classify(Some(&json!("continue")), prefix),
            OnFailure::Keyword(FailureKeyword::Continue)
        );
        assert_eq!(
            OnFailure::classify(Some(&json!("/debug {work_id}")), prefix),
            OnFailure::Command("/debug {work_id}".to_string())
        );
        assert_eq!(
            OnFailure::classify(Some(&json!({"command": "/fix", "args": ["--deep"]})), prefix),
            OnFailure::Structured(StructuredHandler {
                command: "/fix".to_string(),
                args: vec!["--deep".to_string()],
                retry_on_success: true,
                max_retries: 1,
            })
        );
        assert!(matches!(
            OnFailure::classify(Some(&json!("invalid_value")), prefix),
            OnFailure::Invalid { .. }
        ));
        assert!(matches!(OnFailure::classify(Some(&json!("/")), prefix), OnFailure::Invalid { .. }));
        assert!(matches!(OnFailure::classify(Some(&json!("STOP")), prefix), OnFailure::Invalid { .. }));
        assert!(matches!(OnFailure::classify(Some(&json!(3)), prefix), OnFailure::Invalid { .. }));
        assert!(matches!(
            OnFailure::classify(Some(&json!({"command": "/fix", "max_retries": 0})), prefix),
            OnFailure::Invalid { .. }
        ));
        assert!(matches!(
            OnFailure::classify(Some(&json!({"command": "/fix", "retry_on_success": "yes"})), prefix),
            OnFailure::Invalid { .. }
        ));
        assert!(matches!(
            OnFailure::classify(Some(&json!({"args": "x"})), prefix),
            OnFailure::Invalid { .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_invokes_nothing() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let mut executor = MockHandlerExecutor::new();
        executor.expect_invoke().never();
        let dispatcher = dispatcher(executor, log.clone());

        let mut step = failed_step(OnFailure::default());
        let outcome = dispatcher
            .dispatch("run-1", &mut step, &SubstitutionContext::new())
            .await
            .unwrap();

        assert!(matches!(outcome.action, FailureAction::Stop { .. }));
        assert!(outcome.halts_workflow());
        assert!(step.remediation.is_none());
        assert_eq!(step.status, StepStatus::Failure);
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_continue_keeps_failure_and_invokes_nothing() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let mut executor = MockHandlerExecutor::new();
        executor.expect_invoke().never();
        let dispatcher = dispatcher(executor, log.clone());

        let mut step = failed_step(OnFailure::classify(Some(&json!("continue")), "/"));
        let prepared = dispatcher
            .prepare("run-1", &mut step, &SubstitutionContext::new())
            .await
            .unwrap();

        let PreparedDispatch::Resolved(outcome) = prepared else {
            panic!("continue must resolve without a handler");
        };
        assert_eq!(outcome.action, FailureAction::Continue);
        assert!(!outcome.halts_workflow());
        assert_eq!(step.status, StepStatus::Failure);
        assert!(step.is_skippable_failure());
        let record = step.remediation.as_ref().unwrap();
        assert_eq!(record.handler_type, HandlerType::Keyword);
        assert_eq!(record.handler_command, "continue");
        assert_eq!(record.retry_count, 0);
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_structured_handler_appends_args() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let mut executor = MockHandlerExecutor::new();
        executor
            .expect_invoke()
            .withf(|cmd: &str| cmd == "/fix --deep implement")
            .times(1)
            .returning(|_| Ok(HandlerResult::success("fixed")));
        let dispatcher = dispatcher(executor, log);

        let mut step = failed_step(OnFailure::classify(
            Some(&json!({"command": "/fix", "args": ["--deep", "{step_id}"], "max_retries": 2})),
            "/",
        ));
        let context = SubstitutionContext::new().with_var(STEP_ID, "implement");
        let outcome = dispatcher.dispatch("run-1", &mut step, &context).await.unwrap();

        assert_eq!(
            outcome.action,
            FailureAction::RetryStep {
                retry_count: 1,
                max_retries: 2
            }
        );
        assert_eq!(step.remediation.as_ref().unwrap().handler_type, HandlerType::Structured);
    }

    #[tokio::test]
    async fn test_invalid_records_warning_and_stops() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let mut executor = MockHandlerExecutor::new();
        executor.expect_invoke().never();
        let dispatcher = dispatcher(executor, log.clone());

        let mut step = failed_step(OnFailure::classify(Some(&json!("invalid_value")), "/"));
        let outcome = dispatcher
            .dispatch("run-1", &mut step, &SubstitutionContext::new())
            .await
            .unwrap();

        assert!(outcome.halts_workflow());
        assert_eq!(outcome.warnings.len(), 1);
        let events = log.read_events("run-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StepHandlerWarning);
        assert_eq!(events[0].payload["coerced_to"], "stop");
    }

    #[tokio::test]
    async fn test_command_handler_success_schedules_retry() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let mut executor = MockHandlerExecutor::new();
        executor
            .expect_invoke()
            .withf(|cmd: &str| cmd == "/debug --work-id 137 --error \"missing field\"")
            .times(1)
            .returning(|_| Ok(HandlerResult::success("patched")));
        let dispatcher = dispatcher(executor, log.clone());

        let mut step = failed_step(OnFailure::Command(
            "/debug --work-id {work_id} --error \"{error}\"".to_string(),
        ));
        let context = SubstitutionContext::new()
            .with_var(WORK_ID, "137")
            .with_error("missing field");
        let outcome = dispatcher.dispatch("run-1", &mut step, &context).await.unwrap();

        assert_eq!(
            outcome.action,
            FailureAction::RetryStep {
                retry_count: 1,
                max_retries: 1
            }
        );
        assert_eq!(step.status, StepStatus::Retrying);
        let record = step.remediation.as_ref().unwrap();
        assert_eq!(record.handler_type, HandlerType::Command);
        assert_eq!(record.handler_command, "/debug --work-id 137 --error \"missing field\"");
        assert!(record.handler_invoked_at.is_some());

        let events = log.read_events("run-1").await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::StepRemediationStarted, EventType::StepHandlerInvoked]
        );
        assert_eq!(events[1].payload["original_status"], "failure");
        assert_eq!(events[1].payload["result"]["status"], "success");
    }

    #[tokio::test]
    async fn test_capability_failure_is_remediation_failed() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let mut executor = MockHandlerExecutor::new();
        executor.expect_invoke().times(1).returning(|_| {
            Err(HandlerInvocationError::Crashed {
                reason: "segfault".to_string(),
            })
        });
        let dispatcher = dispatcher(executor, log.clone());

        let mut step = failed_step(OnFailure::Command("/fix".to_string()));
        let outcome = dispatcher
            .dispatch("run-1", &mut step, &SubstitutionContext::new())
            .await
            .unwrap();

        assert_eq!(step.status, StepStatus::RemediationFailed);
        match outcome.action {
            FailureAction::RemediationFailed {
                original_error,
                handler_message,
            } => {
                assert_eq!(original_error, "missing field");
                assert!(handler_message.contains("segfault"));
            }
            other => panic!("unexpected action {:?}", other),
        }
        let events = log.read_events("run-1").await.unwrap();
        assert_eq!(events[1].payload["capability_failed"], true);
    }

    #[tokio::test]
    async fn test_retry_on_success_disabled_halts() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let mut executor = MockHandlerExecutor::new();
        executor
            .expect_invoke()
            .returning(|_| Ok(HandlerResult::success("filed a ticket")));
        let dispatcher = dispatcher(executor, log);

        let mut step = failed_step(OnFailure::classify(
            Some(&json!({"command": "/report", "retry_on_success": false})),
            "/",
        ));
        let outcome = dispatcher
            .dispatch("run-1", &mut step, &SubstitutionContext::new())
            .await
            .unwrap();

        assert!(outcome.halts_workflow());
        assert_eq!(step.status, StepStatus::RemediationFailed);
    }

    #[tokio::test]
    async fn test_keyword_retry_until_budget_then_stop() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let mut executor = MockHandlerExecutor::new();
        executor.expect_invoke().never();
        let dispatcher = dispatcher(executor, log).with_config(DispatchConfig {
            command_prefix: "/".to_string(),
            default_max_retries: 2,
        });

        let mut step = failed_step(OnFailure::Keyword(FailureKeyword::Retry));
        for expected in 1..=2 {
            let outcome = dispatcher
                .dispatch("run-1", &mut step, &SubstitutionContext::new())
                .await
                .unwrap();
            assert_eq!(
                outcome.action,
                FailureAction::RetryStep {
                    retry_count: expected,
                    max_retries: 2
                }
            );
            // the caller re-runs the step, which fails again
            step.status = StepStatus::Failure;
        }

        let outcome = dispatcher
            .dispatch("run-1", &mut step, &SubstitutionContext::new())
            .await
            .unwrap();
        assert!(matches!(outcome.action, FailureAction::Stop { .. }));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_requires_failed_step() {
        let log = Arc::new(InMemoryEventLog::new("test"));
        let dispatcher = dispatcher(MockHandlerExecutor::new(), log);

        let mut step = Step::new("a", "a", "build", OnFailure::default());
        let err = dispatcher
            .dispatch("run-1", &mut step, &SubstitutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::StepNotFailed { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_executor_fails_closed() {
        let result = UnavailableHandlerExecutor.invoke("/fix").await;
        assert!(matches!(result, Err(HandlerInvocationError::Unavailable { .. })));
    }

    #[test]
    fn test_process_executor_maps_exit_status() {
        tokio_test::block_on(async {
            let echo = ProcessHandlerExecutor::new("echo", Duration::from_secs(5));
            let result = echo.invoke("/fix now").await.unwrap();
            assert!(result.is_success());
            assert_eq!(result.message, "/fix now");

            let failing = ProcessHandlerExecutor::new("false", Duration::from_secs(5));
            let result = failing.invoke("/fix").await.unwrap();
            assert!(!result.is_success());
            assert_eq!(result.message, "handler exited with status 1");
        });
    }

    #[test]
    fn test_process_executor_missing_program_is_unavailable() {
        tokio_test::block_on(async {
            let missing = ProcessHandlerExecutor::new("runwarden-no-such-handler", Duration::from_secs(5));
            let err = missing.invoke("/fix").await.unwrap_err();
            assert!(matches!(err, HandlerInvocationError::Unavailable { .. }));
        });
    }
}
