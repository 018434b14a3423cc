use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::info;

use super::state::validate_identifier;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("IO error reading plan: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON plan: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse TOML plan: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Unsupported plan format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("Invalid plan: {reason}")]
    Invalid { reason: String },
}

/// A single step as declared by the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Raw failure handler declaration; classified when a run is created
    #[serde(default)]
    pub on_failure: Option<serde_json::Value>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            on_failure: None,
        }
    }

    pub fn with_on_failure(mut self, on_failure: serde_json::Value) -> Self {
        self.on_failure = Some(on_failure);
        self
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub pre_steps: Vec<PlanStep>,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub post_steps: Vec<PlanStep>,
}

fn default_enabled() -> bool {
    true
}

impl PlanPhase {
    /// Pre, main and post steps in execution order
    pub fn all_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.pre_steps
            .iter()
            .chain(self.steps.iter())
            .chain(self.post_steps.iter())
    }

    pub fn step_count(&self) -> usize {
        self.pre_steps.len() + self.steps.len() + self.post_steps.len()
    }
}

/// Authoritative workflow plan; source of expected step counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub plan_id: String,
    pub phases: Vec<PlanPhase>,
}

impl PlanDefinition {
    /// Load a plan from a `.json` or `.toml` file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let plan: PlanDefinition = match extension.as_str() {
            "json" => serde_json::from_str(&contents)?,
            "toml" => toml::from_str(&contents)?,
            other => {
                return Err(PlanError::UnsupportedFormat {
                    extension: other.to_string(),
                })
            }
        };
        plan.validate()?;

        info!(
            plan_id = %plan.plan_id,
            phases = plan.phases.len(),
            expected_steps = plan.expected_step_count(),
            file = ?path,
            "Plan loaded"
        );
        Ok(plan)
    }

    /// Structural checks: identifiers present, phase names and step ids unique
    pub fn validate(&self) -> Result<(), PlanError> {
        validate_identifier("plan_id", &self.plan_id)
            .map_err(|reason| PlanError::Invalid { reason })?;

        let mut phase_names = HashSet::new();
        let mut step_ids = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(PlanError::Invalid {
                    reason: "phase name must not be empty".to_string(),
                });
            }
            if !phase_names.insert(phase.name.as_str()) {
                return Err(PlanError::Invalid {
                    reason: format!("duplicate phase '{}'", phase.name),
                });
            }
            for step in phase.all_steps() {
                if step.id.trim().is_empty() {
                    return Err(PlanError::Invalid {
                        reason: format!("phase '{}' has a step with an empty id", phase.name),
                    });
                }
                if !step_ids.insert(step.id.as_str()) {
                    return Err(PlanError::Invalid {
                        reason: format!("duplicate step id '{}' in phase '{}'", step.id, phase.name),
                    });
                }
            }
        }
        Ok(())
    }

    /// Sum of pre/main/post steps across enabled phases
    pub fn expected_step_count(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.enabled)
            .map(PlanPhase::step_count)
            .sum()
    }

    pub fn phase(&self, name: &str) -> Option<&PlanPhase> {
        self.phases.iter().find(|p| p.name == name)
    }
}
