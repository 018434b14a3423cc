use anyhow::Result;
use std::path::PathBuf;

use super::{print_json, Command};
use crate::config::RunwardenConfig;
use crate::workflow::{PlanDefinition, RunCoordinator, RunEnvironment};

pub struct InitCommand {
    config: RunwardenConfig,
    plan: PathBuf,
    run_id: String,
    work_id: Option<String>,
}

impl InitCommand {
    pub fn new(config: RunwardenConfig, plan: PathBuf, run_id: String) -> Self {
        Self {
            config,
            plan,
            run_id,
            work_id: None,
        }
    }

    pub fn with_work_id(mut self, work_id: Option<String>) -> Self {
        self.work_id = work_id;
        self
    }
}

impl Command for InitCommand {
    async fn execute(&self) -> Result<bool> {
        let plan = PlanDefinition::load(&self.plan).await?;
        let env = RunEnvironment::from_config(&self.config);
        let coordinator = RunCoordinator::create(plan, &self.run_id, self.work_id.clone(), env).await?;

        print_json(coordinator.run())?;
        Ok(true)
    }
}
