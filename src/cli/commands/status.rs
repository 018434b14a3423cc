use anyhow::{anyhow, Result};
use serde_json::json;

use super::{print_json, state_store, Command};
use crate::config::RunwardenConfig;

pub struct StatusCommand {
    config: RunwardenConfig,
    run_id: String,
    checkpoints: bool,
}

impl StatusCommand {
    pub fn new(config: RunwardenConfig, run_id: String) -> Self {
        Self {
            config,
            run_id,
            checkpoints: false,
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: bool) -> Self {
        self.checkpoints = checkpoints;
        self
    }
}

impl Command for StatusCommand {
    async fn execute(&self) -> Result<bool> {
        let store = state_store(&self.config);
        let run = store
            .load_run(&self.run_id)
            .await?
            .ok_or_else(|| anyhow!("run not found: {}", self.run_id))?;

        if self.checkpoints {
            let checkpoints = store.list_checkpoints(&self.run_id).await?;
            print_json(&json!({ "run": run, "checkpoints": checkpoints }))?;
        } else {
            print_json(&run)?;
        }
        Ok(true)
    }
}
