use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use super::{event_sources, print_json, state_store, Command};
use crate::config::RunwardenConfig;
use crate::workflow::{FileEventLog, IntegrityChecker};

pub struct CheckCommand {
    config: RunwardenConfig,
    run_id: String,
    extra_event_dirs: Vec<PathBuf>,
}

impl CheckCommand {
    pub fn new(config: RunwardenConfig, run_id: String) -> Self {
        Self {
            config,
            run_id,
            extra_event_dirs: Vec::new(),
        }
    }

    pub fn with_event_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.extra_event_dirs = dirs;
        self
    }
}

impl Command for CheckCommand {
    async fn execute(&self) -> Result<bool> {
        let mut sources = event_sources(&self.config);
        for dir in &self.extra_event_dirs {
            sources.push(Arc::new(FileEventLog::new(dir)));
        }

        let checker = IntegrityChecker::new(state_store(&self.config), sources);
        let report = checker.check(&self.run_id).await?;
        print_json(&report)?;
        Ok(report.passed())
    }
}
