//! Workflow state layer
//!
//! A run is a versioned snapshot ([`state::WorkflowRun`]) next to an
//! append-only event log ([`events`]). The snapshot is a projection: every
//! claim it makes about finished work must be backed by an event, and every
//! change to it passes the [`transition::TransitionValidator`] before anything
//! is written. [`coordinator::RunCoordinator`] is the only writer.

pub mod completion;
pub mod continuity;
pub mod coordinator;
pub mod events;
pub mod failure_handler;
pub mod integrity;
pub mod lock;
pub mod persistence;
pub mod plan;
pub mod state;
pub mod substitution;
pub mod transition;

pub use completion::{CheckStatus, CompletionVerifier, VerificationCheck, VerificationReport, VerificationStatus};
pub use continuity::{reconcile, Adjustment, ReconciliationReport};
pub use coordinator::{CoordinatorError, RunCoordinator, RunEnvironment};
pub use events::{Event, EventLog, EventLogError, EventSource, EventType, FileEventLog, InMemoryEventLog};
pub use failure_handler::{
    DispatchConfig, DispatchOutcome, FailureAction, FailureHandlerDispatcher, HandlerExecutor, OnFailure,
    ProcessHandlerExecutor, UnavailableHandlerExecutor,
};
pub use integrity::{Discrepancy, IntegrityChecker, IntegrityReport, VerificationError};
pub use persistence::{FileSystemStateStore, PersistenceError, SnapshotReason, StateStore, StoreConfig};
pub use plan::{PlanDefinition, PlanError, PlanPhase, PlanStep};
pub use state::{
    HandlerResult, Phase, PhaseStatus, RemediationRecord, RunStatus, Step, StepOutcome, StepResult, StepStatus,
    WorkflowRun,
};
pub use transition::{TransitionValidator, ValidationResult, Violation, ViolationRule};
