use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::workflow::failure_handler::DispatchConfig;
use crate::workflow::persistence::StoreConfig;

/// Main configuration structure for runwarden
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunwardenConfig {
    /// Where run snapshots, events and locks live
    pub storage: StorageConfig,
    /// Failure handler classification and execution
    pub failure_handling: FailureHandlingConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory for `<run_id>.state.json`, checkpoints and lock files
    pub state_directory: String,
    /// Directory for `<run_id>.events.jsonl`
    pub events_directory: String,
    pub checkpoint_retention_days: u32,
    /// Verify the snapshot hash on every load
    pub enable_integrity_checks: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailureHandlingConfig {
    /// Prefix that marks an `on_failure` string as a command
    pub command_prefix: String,
    /// Budget for `retry` and plain command handlers
    pub default_max_retries: u32,
    /// Program that receives each resolved handler command as its argument
    pub handler_program: Option<String>,
    pub handler_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// JSON log lines instead of human-readable text
    pub json_logs: bool,
}

impl Default for RunwardenConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                state_directory: ".runwarden/state".to_string(),
                events_directory: ".runwarden/events".to_string(),
                checkpoint_retention_days: 7,
                enable_integrity_checks: true,
            },
            failure_handling: FailureHandlingConfig {
                command_prefix: "/".to_string(),
                default_max_retries: 1,
                handler_program: None, // no handler program: remediation fails closed
                handler_timeout_seconds: 600,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
            },
        }
    }
}

impl StorageConfig {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            state_directory: PathBuf::from(&self.state_directory),
            checkpoint_retention_days: self.checkpoint_retention_days,
            enable_integrity_checks: self.enable_integrity_checks,
        }
    }
}

impl FailureHandlingConfig {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            command_prefix: self.command_prefix.clone(),
            default_max_retries: self.default_max_retries,
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_seconds)
    }
}

impl RunwardenConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (runwarden.toml, .runwarden-rc)
    /// 3. Environment variables (RUNWARDEN_<SECTION>__<KEY>)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("runwarden.toml").exists() {
            builder = builder.add_source(File::with_name("runwarden"));
        }

        if Path::new(".runwarden-rc").exists() {
            builder = builder.add_source(File::new(".runwarden-rc", config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("RUNWARDEN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let runwarden_config: RunwardenConfig = config.try_deserialize()?;
        runwarden_config.validate()?;
        Ok(runwarden_config)
    }

    /// Load from an explicit TOML file on top of the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path).format(config::FileFormat::Toml))
            .build()?;

        let runwarden_config: RunwardenConfig = config.try_deserialize()?;
        runwarden_config.validate()?;
        Ok(runwarden_config)
    }

    /// Reject values that would make failure handling ambiguous
    pub fn validate(&self) -> Result<()> {
        if self.failure_handling.command_prefix.is_empty() {
            anyhow::bail!("failure_handling.command_prefix must not be empty");
        }
        if ["stop", "continue", "retry"]
            .iter()
            .any(|keyword| keyword.starts_with(self.failure_handling.command_prefix.as_str()))
        {
            anyhow::bail!(
                "failure_handling.command_prefix '{}' collides with an on_failure keyword",
                self.failure_handling.command_prefix
            );
        }
        if self.failure_handling.default_max_retries == 0 {
            anyhow::bail!("failure_handling.default_max_retries must be at least 1");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<RunwardenConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = RunwardenConfig::load_env_file();
        RunwardenConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static RunwardenConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
