use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Instant;
use tracing::info;

/// Process-wide counters for the run ledger
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    pub events_appended: AtomicU64,
    pub transitions_accepted: AtomicU64,
    pub transitions_rejected: AtomicU64,
    pub discrepancies_found: AtomicU64,
    pub handler_invocations: AtomicU64,
    pub handler_failures: AtomicU64,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event_appended(&self) {
        self.events_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition_accepted(&self) {
        self.transitions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition_rejected(&self) {
        self.transitions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discrepancies(&self, count: usize) {
        self.discrepancies_found.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_handler_invocation(&self) {
        self.handler_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> LedgerStats {
        LedgerStats {
            events_appended: self.events_appended.load(Ordering::Relaxed),
            transitions_accepted: self.transitions_accepted.load(Ordering::Relaxed),
            transitions_rejected: self.transitions_rejected.load(Ordering::Relaxed),
            discrepancies_found: self.discrepancies_found.load(Ordering::Relaxed),
            handler_invocations: self.handler_invocations.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            events_appended = stats.events_appended,
            transitions_accepted = stats.transitions_accepted,
            transitions_rejected = stats.transitions_rejected,
            discrepancies_found = stats.discrepancies_found,
            handler_invocations = stats.handler_invocations,
            handler_failures = stats.handler_failures,
            "Ledger metrics"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStats {
    pub events_appended: u64,
    pub transitions_accepted: u64,
    pub transitions_rejected: u64,
    pub discrepancies_found: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
}

static LEDGER_METRICS: LazyLock<LedgerMetrics> = LazyLock::new(LedgerMetrics::new);

pub fn ledger_metrics() -> &'static LedgerMetrics {
    &LEDGER_METRICS
}

/// Span shared by everything done to one run within a single operation
pub fn create_run_span(operation: &str, run_id: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "run",
        operation = operation,
        run.id = run_id,
        correlation.id = correlation_id,
    )
}

/// Time an operation and log its duration on finish
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}
