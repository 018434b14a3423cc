//! Append-only event log
//!
//! Events are the ground truth for a run. The state snapshot is a projection
//! that the integrity checker cross-validates against what is recorded here.
//! Records are never rewritten or removed; the file backend appends one JSON
//! object per line and syncs before returning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::validate_identifier;
use crate::observability::ledger_metrics;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Malformed event record in {source_name} at line {line}: {reason}")]
    MalformedRecord {
        source_name: String,
        line: usize,
        reason: String,
    },

    #[error("Event {event_type} is missing required field '{field}'")]
    MissingIdentifier { event_type: EventType, field: String },

    #[error("Invalid identifier: {reason}")]
    InvalidIdentifier { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStart,
    WorkflowComplete,
    WorkflowFailed,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelled,
    PhaseStart,
    PhaseComplete,
    PhaseSkipped,
    StepStart,
    StepComplete,
    StepRemediationStarted,
    StepHandlerInvoked,
    StepHandlerWarning,
    StepRetryScheduled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStart => "workflow_start",
            EventType::WorkflowComplete => "workflow_complete",
            EventType::WorkflowFailed => "workflow_failed",
            EventType::WorkflowPaused => "workflow_paused",
            EventType::WorkflowResumed => "workflow_resumed",
            EventType::WorkflowCancelled => "workflow_cancelled",
            EventType::PhaseStart => "phase_start",
            EventType::PhaseComplete => "phase_complete",
            EventType::PhaseSkipped => "phase_skipped",
            EventType::StepStart => "step_start",
            EventType::StepComplete => "step_complete",
            EventType::StepRemediationStarted => "step_remediation_started",
            EventType::StepHandlerInvoked => "step_handler_invoked",
            EventType::StepHandlerWarning => "step_handler_warning",
            EventType::StepRetryScheduled => "step_retry_scheduled",
        }
    }

    fn requires_step(&self) -> bool {
        matches!(
            self,
            EventType::StepStart
                | EventType::StepComplete
                | EventType::StepRemediationStarted
                | EventType::StepHandlerInvoked
                | EventType::StepHandlerWarning
                | EventType::StepRetryScheduled
        )
    }

    fn requires_phase(&self) -> bool {
        self.requires_step()
            || matches!(
                self,
                EventType::PhaseStart | EventType::PhaseComplete | EventType::PhaseSkipped
            )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record that something specific happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(run_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id: run_id.into(),
            event_type,
            timestamp: Utc::now(),
            step_id: None,
            phase: None,
            payload: json!({}),
        }
    }

    pub fn for_step(
        run_id: impl Into<String>,
        event_type: EventType,
        phase: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(run_id, event_type);
        event.phase = Some(phase.into());
        event.step_id = Some(step_id.into());
        event
    }

    pub fn for_phase(run_id: impl Into<String>, event_type: EventType, phase: impl Into<String>) -> Self {
        let mut event = Self::new(run_id, event_type);
        event.phase = Some(phase.into());
        event
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// `status` field of the payload, if any
    pub fn outcome(&self) -> Option<&str> {
        self.payload.get("status").and_then(|v| v.as_str())
    }

    /// A `step_complete` whose recorded outcome is success or warning.
    /// Events without a status are treated as success.
    pub fn is_step_completion(&self) -> bool {
        self.event_type == EventType::StepComplete
            && matches!(self.outcome(), None | Some("success") | Some("warning"))
    }

    /// Required identifiers are present for the event type
    pub fn validate(&self) -> Result<(), EventLogError> {
        validate_identifier("run_id", &self.run_id)
            .map_err(|reason| EventLogError::InvalidIdentifier { reason })?;

        if self.event_type.requires_phase() && self.phase.as_deref().map_or(true, str::is_empty) {
            return Err(EventLogError::MissingIdentifier {
                event_type: self.event_type,
                field: "phase".to_string(),
            });
        }
        if self.event_type.requires_step() && self.step_id.as_deref().map_or(true, str::is_empty) {
            return Err(EventLogError::MissingIdentifier {
                event_type: self.event_type,
                field: "step_id".to_string(),
            });
        }
        Ok(())
    }
}

/// Read side of an event store. Several sources may be merged by the checker.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn source_name(&self) -> String;

    async fn read_events(&self, run_id: &str) -> Result<Vec<Event>, EventLogError>;
}

/// Append-only write side
#[async_trait]
pub trait EventLog: EventSource {
    /// Durably append an event; returns once the record is on stable storage
    async fn append(&self, event: &Event) -> Result<(), EventLogError>;
}

/// Read every source and concatenate; order carries no meaning for matching
pub async fn collect_events(
    run_id: &str,
    sources: &[std::sync::Arc<dyn EventSource>],
) -> Result<Vec<Event>, EventLogError> {
    let mut events = Vec::new();
    for source in sources {
        let mut batch = source.read_events(run_id).await?;
        debug!(
            run_id = %run_id,
            source = %source.source_name(),
            count = batch.len(),
            "Read events from source"
        );
        events.append(&mut batch);
    }
    Ok(events)
}

/// JSON-lines file per run
pub struct FileEventLog {
    directory: PathBuf,
}

impl FileEventLog {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn event_file_path(&self, run_id: &str) -> PathBuf {
        self.directory.join(format!("{}.events.jsonl", run_id))
    }
}

#[async_trait]
impl EventSource for FileEventLog {
    fn source_name(&self) -> String {
        self.directory.display().to_string()
    }

    async fn read_events(&self, run_id: &str) -> Result<Vec<Event>, EventLogError> {
        validate_identifier("run_id", run_id)
            .map_err(|reason| EventLogError::InvalidIdentifier { reason })?;

        let path = self.event_file_path(run_id);
        if !path.exists() {
            return Ok(vec![]);
        }

        let contents = fs::read_to_string(&path).await?;
        let ends_cleanly = contents.ends_with('\n');
        let lines: Vec<&str> = contents.lines().collect();
        let mut events = Vec::with_capacity(lines.len());

        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) if index + 1 == lines.len() && !ends_cleanly => {
                    // Torn final write from a crash; the append never completed.
                    warn!(
                        run_id = %run_id,
                        file = ?path,
                        error = %e,
                        "Ignoring incomplete trailing event record"
                    );
                }
                Err(e) => {
                    return Err(EventLogError::MalformedRecord {
                        source_name: path.display().to_string(),
                        line: index + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }

        Ok(events)
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn append(&self, event: &Event) -> Result<(), EventLogError> {
        event.validate()?;
        fs::create_dir_all(&self.directory).await?;

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let path = self.event_file_path(&event.run_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        ledger_metrics().record_event_appended();
        debug!(
            run_id = %event.run_id,
            event_type = %event.event_type,
            step_id = ?event.step_id,
            phase = ?event.phase,
            "Event appended"
        );
        Ok(())
    }
}

/// Process-local event log, used for secondary sources and tests
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    name: String,
    events: RwLock<Vec<Event>>,
}

impl InMemoryEventLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventSource for InMemoryEventLog {
    fn source_name(&self) -> String {
        self.name.clone()
    }

    async fn read_events(&self, run_id: &str) -> Result<Vec<Event>, EventLogError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: &Event) -> Result<(), EventLogError> {
        event.validate()?;
        self.events.write().await.push(event.clone());
        ledger_metrics().record_event_appended();
        Ok(())
    }
}

/// What the merged event log corroborates, keyed for order-independent lookup
#[derive(Debug, Clone, Default)]
pub struct EventEvidence {
    /// (phase, step_id) -> recorded outcome of the completion event
    step_completions: HashMap<(String, String), String>,
    phase_completions: HashSet<String>,
    workflow_complete: bool,
    /// (phase, step_id) -> remediation attempts begun (handler or keyword retry)
    remediation_attempts: HashMap<(String, String), u32>,
    /// (phase, step_id) -> payload of the latest `step_handler_invoked`
    last_handler_invocation: HashMap<(String, String), serde_json::Value>,
    /// Latest run lifecycle event (start, pause, resume, fail, cancel, complete)
    latest_run_event: Option<(DateTime<Utc>, EventType)>,
}

impl EventEvidence {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut evidence = Self::default();
        let mut handler_invocations: HashMap<(String, String), (DateTime<Utc>, serde_json::Value)> =
            HashMap::new();

        for event in events {
            let step_key = match (&event.phase, &event.step_id) {
                (Some(phase), Some(step_id)) => Some((phase.clone(), step_id.clone())),
                _ => None,
            };

            match event.event_type {
                EventType::StepComplete if event.is_step_completion() => {
                    if let Some(key) = step_key {
                        let outcome = event.outcome().unwrap_or("success").to_string();
                        evidence.step_completions.insert(key, outcome);
                    }
                }
                EventType::PhaseComplete => {
                    if let Some(phase) = &event.phase {
                        evidence.phase_completions.insert(phase.clone());
                    }
                }
                EventType::WorkflowComplete => {
                    evidence.workflow_complete = true;
                    evidence.note_run_event(event);
                }
                EventType::WorkflowStart
                | EventType::WorkflowFailed
                | EventType::WorkflowPaused
                | EventType::WorkflowResumed
                | EventType::WorkflowCancelled => evidence.note_run_event(event),
                EventType::StepRemediationStarted | EventType::StepRetryScheduled => {
                    if let Some(key) = step_key {
                        *evidence.remediation_attempts.entry(key).or_insert(0) += 1;
                    }
                }
                EventType::StepHandlerInvoked => {
                    if let Some(key) = step_key {
                        let newer = handler_invocations
                            .get(&key)
                            .map_or(true, |(seen, _)| event.timestamp >= *seen);
                        if newer {
                            handler_invocations.insert(key, (event.timestamp, event.payload.clone()));
                        }
                    }
                }
                _ => {}
            }
        }

        evidence.last_handler_invocation = handler_invocations
            .into_iter()
            .map(|(key, (_, payload))| (key, payload))
            .collect();
        evidence
    }

    fn note_run_event(&mut self, event: &Event) {
        let newer = self
            .latest_run_event
            .map_or(true, |(seen, _)| event.timestamp >= seen);
        if newer {
            self.latest_run_event = Some((event.timestamp, event.event_type));
        }
    }

    pub fn latest_run_event(&self) -> Option<EventType> {
        self.latest_run_event.map(|(_, event_type)| event_type)
    }

    pub fn step_completed(&self, phase: &str, step_id: &str) -> bool {
        self.step_completion_outcome(phase, step_id).is_some()
    }

    pub fn step_completion_outcome(&self, phase: &str, step_id: &str) -> Option<&str> {
        self.step_completions
            .get(&(phase.to_string(), step_id.to_string()))
            .map(String::as_str)
    }

    pub fn phase_completed(&self, phase: &str) -> bool {
        self.phase_completions.contains(phase)
    }

    pub fn workflow_completed(&self) -> bool {
        self.workflow_complete
    }

    pub fn remediation_attempts(&self, phase: &str, step_id: &str) -> u32 {
        self.remediation_attempts
            .get(&(phase.to_string(), step_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn last_handler_invocation(&self, phase: &str, step_id: &str) -> Option<&serde_json::Value> {
        self.last_handler_invocation
            .get(&(phase.to_string(), step_id.to_string()))
    }

    /// Every (phase, step_id) with a completion event
    pub fn completed_steps(&self) -> impl Iterator<Item = (&str, &str)> {
        self.step_completions
            .keys()
            .map(|(phase, step)| (phase.as_str(), step.as_str()))
    }
}
