// Runwarden Library - Workflow State Integrity
// Event-backed run state, transition validation and failure handling

pub mod cli;
pub mod config;
pub mod observability;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use config::{config, init_config, RunwardenConfig};
pub use observability::{create_run_span, ledger_metrics, LedgerMetrics, OperationTimer};
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use workflow::{
    CompletionVerifier, CoordinatorError, Event, EventLog, EventType, FileEventLog, FileSystemStateStore,
    IntegrityChecker, IntegrityReport, PlanDefinition, RunCoordinator, RunEnvironment, StateStore, StepResult,
    TransitionValidator, ValidationResult, VerificationReport, WorkflowRun,
};
