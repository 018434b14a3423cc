use anyhow::Result;
use clap::Parser;
use tracing::Instrument;

use runwarden::cli::commands::check::CheckCommand;
use runwarden::cli::commands::init::InitCommand;
use runwarden::cli::commands::resume::ResumeCommand;
use runwarden::cli::commands::status::StatusCommand;
use runwarden::cli::commands::verify::VerifyCommand;
use runwarden::cli::commands::{load_config, Command};
use runwarden::cli::{Cli, Commands};
use runwarden::observability::{create_run_span, ledger_metrics};
use runwarden::telemetry::{generate_correlation_id, init_telemetry};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_telemetry(&config.observability.log_level, config.observability.json_logs)?;

    let span = create_run_span(cli.command.name(), cli.command.run_id(), &generate_correlation_id());

    let command = async {
        match cli.command {
            Commands::Init { plan, run_id, work_id } => {
                InitCommand::new(config, plan, run_id)
                    .with_work_id(work_id)
                    .execute()
                    .await
            }
            Commands::Status { run_id, checkpoints } => {
                StatusCommand::new(config, run_id)
                    .with_checkpoints(checkpoints)
                    .execute()
                    .await
            }
            Commands::Check { run_id, extra_event_dirs } => {
                CheckCommand::new(config, run_id)
                    .with_event_dirs(extra_event_dirs)
                    .execute()
                    .await
            }
            Commands::Verify { run_id, plan } => VerifyCommand::new(config, run_id).with_plan(plan).execute().await,
            Commands::Resume { run_id, plan } => ResumeCommand::new(config, run_id, plan).execute().await,
        }
    };
    let outcome = tokio::runtime::Runtime::new()?.block_on(command.instrument(span));
    ledger_metrics().log_stats();
    let passed = outcome?;

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}
