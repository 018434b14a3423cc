use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::persistence::PersistenceError;
use super::state::validate_identifier;

/// Exclusive advisory lock held by the single writer of a run.
///
/// The lock lives as long as the open file; dropping `RunLock` closes it and
/// the OS releases the lock.
#[derive(Debug)]
pub struct RunLock {
    _lock: RwLock<File>,
    path: PathBuf,
    run_id: String,
}

impl RunLock {
    pub fn acquire(directory: &Path, run_id: &str) -> Result<Self, PersistenceError> {
        validate_identifier("run_id", run_id).map_err(|reason| PersistenceError::InvalidRun { reason })?;
        std::fs::create_dir_all(directory)?;

        let path = directory.join(format!("{}.lock", run_id));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let mut lock = RwLock::new(file);
        let guard = lock.try_write().map_err(|e| PersistenceError::LockError {
            reason: format!("run '{}' is owned by another writer: {}", run_id, e),
        })?;
        // Keep the lock until the file closes rather than until the guard drops.
        std::mem::forget(guard);

        info!(run_id = %run_id, lock_file = ?path, "Acquired run lock");
        Ok(Self {
            _lock: lock,
            path,
            run_id: run_id.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!(run_id = %self.run_id, "Released run lock");
    }
}
