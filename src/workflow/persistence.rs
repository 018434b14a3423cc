use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use super::state::{validate_identifier, WorkflowRun};

const SNAPSHOT_FORMAT_VERSION: &str = "1";

/// Errors that can occur during state persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("State corruption detected for run {run_id}: {reason}")]
    StateCorruption { run_id: String, reason: String },

    #[error("Version conflict for run {run_id}: expected stored version {expected}, found {found}")]
    VersionConflict {
        run_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Unsupported snapshot format: expected {expected}, found {found}")]
    FormatMismatch { expected: String, found: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Checkpoint {checkpoint_id} not found for run {run_id}")]
    CheckpointNotFound { run_id: String, checkpoint_id: String },

    #[error("Invalid run record: {reason}")]
    InvalidRun { reason: String },

    #[error("Lock acquisition failed: {reason}")]
    LockError { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotReason {
    StateTransition,
    Reconciliation,
    BeforeRemediation,
    BeforeCompletion,
    UserRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub reason: SnapshotReason,
    pub integrity_hash: String,
    pub writer_pid: Option<u32>,
    pub hostname: String,
    pub persisted_at: DateTime<Utc>,
}

/// On-disk envelope around a run snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRun {
    pub format_version: String,
    pub run: WorkflowRun,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub reason: SnapshotReason,
    pub run_version: u64,
    pub run_status: String,
    pub file_size: u64,
}

/// Configuration for the file-backed state store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub state_directory: PathBuf,
    pub checkpoint_retention_days: u32,
    pub enable_integrity_checks: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_directory: PathBuf::from(".runwarden/state"),
            checkpoint_retention_days: 7,
            enable_integrity_checks: true,
        }
    }
}

/// Current snapshot of each run, one writer per run
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, PersistenceError>;

    /// Persist `run`, whose `version` must equal the stored version (0 for a
    /// new run). Returns the new version.
    async fn save_run(&self, run: &WorkflowRun, reason: SnapshotReason) -> Result<u64, PersistenceError>;

    async fn create_checkpoint(&self, run: &WorkflowRun, reason: SnapshotReason) -> Result<String, PersistenceError>;

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, PersistenceError>;

    async fn restore_from_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<WorkflowRun, PersistenceError>;

    /// Remove checkpoints past retention; returns how many were removed
    async fn cleanup_old_checkpoints(&self, run_id: &str) -> Result<usize, PersistenceError>;
}

/// File system implementation of the state store
pub struct FileSystemStateStore {
    config: StoreConfig,
}

impl FileSystemStateStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    fn state_file_path(&self, run_id: &str) -> PathBuf {
        self.config.state_directory.join(format!("{}.state.json", run_id))
    }

    fn checkpoint_dir(&self, run_id: &str) -> PathBuf {
        self.config.state_directory.join(format!("{}_checkpoints", run_id))
    }

    fn checkpoint_file_path(&self, run_id: &str, checkpoint_id: &str) -> PathBuf {
        self.checkpoint_dir(run_id)
            .join(format!("{}.checkpoint.json", checkpoint_id))
    }

    /// Hash of the serialized run; detects hand edits and torn writes
    fn calculate_integrity_hash(&self, run: &WorkflowRun) -> Result<String, PersistenceError> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let canonical = serde_json::to_string(run)?;
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        Ok(format!("{:x}", hasher.finish()))
    }

    fn envelope(&self, run: &WorkflowRun, reason: SnapshotReason) -> Result<PersistedRun, PersistenceError> {
        let integrity_hash = if self.config.enable_integrity_checks {
            self.calculate_integrity_hash(run)?
        } else {
            "integrity_disabled".to_string()
        };

        Ok(PersistedRun {
            format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
            run: run.clone(),
            metadata: SnapshotMetadata {
                snapshot_id: format!("{}_{}", Utc::now().timestamp(), rand::rng().random::<u32>()),
                reason,
                integrity_hash,
                writer_pid: std::process::id().into(),
                hostname: hostname::get()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string(),
                persisted_at: Utc::now(),
            },
        })
    }

    async fn read_envelope(&self, path: &Path) -> Result<PersistedRun, PersistenceError> {
        let contents = fs::read_to_string(path).await?;
        let persisted: PersistedRun = serde_json::from_str(&contents)?;

        if persisted.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistenceError::FormatMismatch {
                expected: SNAPSHOT_FORMAT_VERSION.to_string(),
                found: persisted.format_version,
            });
        }

        if self.config.enable_integrity_checks {
            let actual = self.calculate_integrity_hash(&persisted.run)?;
            if actual != persisted.metadata.integrity_hash {
                warn!(
                    run_id = %persisted.run.run_id,
                    expected_hash = %persisted.metadata.integrity_hash,
                    actual_hash = %actual,
                    file = ?path,
                    "Snapshot integrity check failed"
                );
                return Err(PersistenceError::StateCorruption {
                    run_id: persisted.run.run_id,
                    reason: "integrity hash mismatch".to_string(),
                });
            }
        }

        Ok(persisted)
    }

    fn check_run_id(run_id: &str) -> Result<(), PersistenceError> {
        validate_identifier("run_id", run_id).map_err(|reason| PersistenceError::InvalidRun { reason })
    }
}

#[async_trait]
impl StateStore for FileSystemStateStore {
    async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, PersistenceError> {
        Self::check_run_id(run_id)?;
        let state_file = self.state_file_path(run_id);

        if !state_file.exists() {
            debug!(run_id = %run_id, file = ?state_file, "No existing state file found");
            return Ok(None);
        }

        let persisted = self.read_envelope(&state_file).await?;
        if persisted.run.run_id != run_id {
            return Err(PersistenceError::StateCorruption {
                run_id: run_id.to_string(),
                reason: format!("state file holds run '{}'", persisted.run.run_id),
            });
        }

        debug!(
            run_id = %run_id,
            version = persisted.run.version,
            snapshot_id = %persisted.metadata.snapshot_id,
            "State loaded"
        );
        Ok(Some(persisted.run))
    }

    async fn save_run(&self, run: &WorkflowRun, reason: SnapshotReason) -> Result<u64, PersistenceError> {
        Self::check_run_id(&run.run_id)?;
        fs::create_dir_all(&self.config.state_directory).await?;

        let state_file = self.state_file_path(&run.run_id);
        let stored_version = if state_file.exists() {
            self.read_envelope(&state_file).await?.run.version
        } else {
            0
        };
        if stored_version != run.version {
            return Err(PersistenceError::VersionConflict {
                run_id: run.run_id.clone(),
                expected: run.version,
                found: stored_version,
            });
        }

        let mut next = run.clone();
        next.version = run.version + 1;
        let persisted = self.envelope(&next, reason.clone())?;
        let serialized = serde_json::to_string_pretty(&persisted)?;

        // Write to temporary file first, then rename (atomic operation)
        let temp_file = format!("{}.tmp", state_file.display());
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &state_file).await?;

        info!(
            run_id = %run.run_id,
            version = next.version,
            status = %next.status,
            reason = ?reason,
            "State saved"
        );
        Ok(next.version)
    }

    async fn create_checkpoint(&self, run: &WorkflowRun, reason: SnapshotReason) -> Result<String, PersistenceError> {
        Self::check_run_id(&run.run_id)?;
        fs::create_dir_all(self.checkpoint_dir(&run.run_id)).await?;

        let persisted = self.envelope(run, reason.clone())?;
        let checkpoint_id = persisted.metadata.snapshot_id.clone();
        let checkpoint_file = self.checkpoint_file_path(&run.run_id, &checkpoint_id);

        fs::write(&checkpoint_file, serde_json::to_string_pretty(&persisted)?).await?;

        info!(
            run_id = %run.run_id,
            checkpoint_id = %checkpoint_id,
            reason = ?reason,
            "Checkpoint created"
        );
        Ok(checkpoint_id)
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<CheckpointInfo>, PersistenceError> {
        Self::check_run_id(run_id)?;
        let checkpoint_dir = self.checkpoint_dir(run_id);
        if !checkpoint_dir.exists() {
            return Ok(vec![]);
        }

        let mut checkpoints = Vec::new();
        let mut entries = fs::read_dir(&checkpoint_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".checkpoint.json"));
            if !is_checkpoint {
                continue;
            }

            let file_size = fs::metadata(&path).await?.len();
            let persisted = self.read_envelope(&path).await?;
            checkpoints.push(CheckpointInfo {
                checkpoint_id: persisted.metadata.snapshot_id,
                created_at: persisted.metadata.persisted_at,
                reason: persisted.metadata.reason,
                run_version: persisted.run.version,
                run_status: persisted.run.status.to_string(),
                file_size,
            });
        }

        // Newest first
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    async fn restore_from_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<WorkflowRun, PersistenceError> {
        Self::check_run_id(run_id)?;
        validate_identifier("checkpoint_id", checkpoint_id)
            .map_err(|reason| PersistenceError::InvalidRun { reason })?;

        let checkpoint_file = self.checkpoint_file_path(run_id, checkpoint_id);
        if !checkpoint_file.exists() {
            return Err(PersistenceError::CheckpointNotFound {
                run_id: run_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            });
        }

        let persisted = self.read_envelope(&checkpoint_file).await?;
        info!(run_id = %run_id, checkpoint_id = %checkpoint_id, "Restored from checkpoint");
        Ok(persisted.run)
    }

    async fn cleanup_old_checkpoints(&self, run_id: &str) -> Result<usize, PersistenceError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.checkpoint_retention_days as i64);
        let mut cleaned_count = 0;

        for checkpoint in self.list_checkpoints(run_id).await? {
            if checkpoint.created_at >= cutoff {
                continue;
            }
            let path = self.checkpoint_file_path(run_id, &checkpoint.checkpoint_id);
            match fs::remove_file(&path).await {
                Ok(()) => cleaned_count += 1,
                Err(e) => warn!(file = ?path, error = %e, "Failed to remove old checkpoint file"),
            }
        }

        if cleaned_count > 0 {
            info!(
                run_id = %run_id,
                cleaned_count,
                retention_days = self.config.checkpoint_retention_days,
                "Cleaned up old checkpoints"
            );
        }
        Ok(cleaned_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::plan::{PlanDefinition, PlanPhase, PlanStep};
    use crate::workflow::state::RunStatus;
    use tempfile::TempDir;

    fn create_test_run() -> WorkflowRun {
        let plan = PlanDefinition {
            plan_id: "plan".to_string(),
            phases: vec![PlanPhase {
                name: "build".to_string(),
                enabled: true,
                pre_steps: vec![],
                steps: vec![PlanStep::new("compile")],
                post_steps: vec![],
            }],
        };
        WorkflowRun::from_plan(&plan, "run-1", Some("42".to_string()), "/")
    }

    fn store(dir: &TempDir) -> FileSystemStateStore {
        FileSystemStateStore::new(StoreConfig {
            state_directory: dir.path().to_path_buf(),
            ..StoreConfig::default()
        })
    }

    #[tokio::test]
    async fn test_save_and_load_bumps_version() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let run = create_test_run();

        let version = store.save_run(&run, SnapshotReason::StateTransition).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.load_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.work_id.as_deref(), Some("42"));
        assert!(store.load_run("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let run = create_test_run();

        store.save_run(&run, SnapshotReason::StateTransition).await.unwrap();
        let err = store.save_run(&run, SnapshotReason::StateTransition).await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::VersionConflict { expected: 0, found: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_tampered_snapshot_detected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store
            .save_run(&create_test_run(), SnapshotReason::StateTransition)
            .await
            .unwrap();

        let path = temp_dir.path().join("run-1.state.json");
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"pending\"", "\"completed\"");
        std::fs::write(&path, tampered).unwrap();

        let err = store.load_run("run-1").await.unwrap_err();
        assert!(matches!(err, PersistenceError::StateCorruption { .. }));
    }

    #[tokio::test]
    async fn test_checkpoint_create_list_restore() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        let mut run = create_test_run();

        let first = store.create_checkpoint(&run, SnapshotReason::BeforeRemediation).await.unwrap();
        run.status = RunStatus::InProgress;
        let _second = store.create_checkpoint(&run, SnapshotReason::UserRequested).await.unwrap();

        let checkpoints = store.list_checkpoints("run-1").await.unwrap();
        assert_eq!(checkpoints.len(), 2);

        let restored = store.restore_from_checkpoint("run-1", &first).await.unwrap();
        assert_eq!(restored.status, RunStatus::Pending);

        let missing = store.restore_from_checkpoint("run-1", "nope").await.unwrap_err();
        assert!(matches!(missing, PersistenceError::CheckpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_run_id_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let err = store.load_run("../escape").await.unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidRun { .. }));
    }
}
