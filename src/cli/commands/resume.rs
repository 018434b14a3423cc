use anyhow::Result;
use std::path::PathBuf;

use super::{print_json, Command};
use crate::config::RunwardenConfig;
use crate::workflow::{PlanDefinition, RunCoordinator, RunEnvironment};

pub struct ResumeCommand {
    config: RunwardenConfig,
    run_id: String,
    plan: PathBuf,
}

impl ResumeCommand {
    pub fn new(config: RunwardenConfig, run_id: String, plan: PathBuf) -> Self {
        Self { config, run_id, plan }
    }
}

impl Command for ResumeCommand {
    async fn execute(&self) -> Result<bool> {
        let plan = PlanDefinition::load(&self.plan).await?;
        let env = RunEnvironment::from_config(&self.config);
        let (_coordinator, report) = RunCoordinator::resume(&self.run_id, plan, env).await?;

        print_json(&report)?;
        Ok(true)
    }
}
