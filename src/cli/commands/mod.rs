use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::RunwardenConfig;
use crate::workflow::{EventSource, FileEventLog, FileSystemStateStore, StateStore};

pub mod check;
pub mod init;
pub mod resume;
pub mod status;
pub mod verify;

#[allow(async_fn_in_trait)]
pub trait Command {
    /// Returns false when the command ran but its report failed
    async fn execute(&self) -> Result<bool>;
}

pub fn load_config(path: Option<&Path>) -> Result<RunwardenConfig> {
    RunwardenConfig::load_env_file()?;
    match path {
        Some(path) => RunwardenConfig::load_from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => RunwardenConfig::load(),
    }
}

pub fn state_store(config: &RunwardenConfig) -> Arc<dyn StateStore> {
    Arc::new(FileSystemStateStore::new(config.storage.store_config()))
}

pub fn event_sources(config: &RunwardenConfig) -> Vec<Arc<dyn EventSource>> {
    vec![Arc::new(FileEventLog::new(&config.storage.events_directory))]
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
