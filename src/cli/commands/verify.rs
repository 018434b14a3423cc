use anyhow::Result;
use std::path::PathBuf;

use super::{event_sources, print_json, state_store, Command};
use crate::config::RunwardenConfig;
use crate::workflow::{CompletionVerifier, PlanDefinition};

pub struct VerifyCommand {
    config: RunwardenConfig,
    run_id: String,
    plan: Option<PathBuf>,
}

impl VerifyCommand {
    pub fn new(config: RunwardenConfig, run_id: String) -> Self {
        Self {
            config,
            run_id,
            plan: None,
        }
    }

    pub fn with_plan(mut self, plan: Option<PathBuf>) -> Self {
        self.plan = plan;
        self
    }
}

impl Command for VerifyCommand {
    async fn execute(&self) -> Result<bool> {
        let mut verifier = CompletionVerifier::new(state_store(&self.config), event_sources(&self.config));
        if let Some(path) = &self.plan {
            verifier = verifier.with_plan(PlanDefinition::load(path).await?);
        }

        let report = verifier.verify(&self.run_id).await?;
        print_json(&report)?;
        Ok(report.passed())
    }
}
