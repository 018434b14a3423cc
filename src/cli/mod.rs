use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "runwarden")]
#[command(about = "Event-backed state ledger for workflow runs")]
#[command(long_about = "Runwarden keeps the persisted state of a workflow run honest: every claimed \
                       step completion must be backed by an event in the run's log. Use 'runwarden check' \
                       to cross-validate a run and 'runwarden verify' before trusting a completed one.")]
pub struct Cli {
    /// Configuration file (defaults to runwarden.toml / .runwarden-rc / RUNWARDEN_* env)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new pending run from a plan
    Init {
        /// Plan definition (.json or .toml)
        #[arg(long)]
        plan: PathBuf,
        /// Identifier for the new run
        #[arg(long)]
        run_id: String,
        /// Work item the run belongs to, available to handlers as {work_id}
        #[arg(long)]
        work_id: Option<String>,
    },
    /// Print the persisted state of a run
    Status {
        run_id: String,
        /// Also list stored checkpoints
        #[arg(long)]
        checkpoints: bool,
    },
    /// Cross-validate a run's state against its event log
    Check {
        run_id: String,
        /// Additional event log directories to merge
        #[arg(long = "events-dir")]
        extra_event_dirs: Vec<PathBuf>,
    },
    /// Decide whether a run may be trusted as complete
    Verify {
        run_id: String,
        /// Plan the run was created from; enables the step count check
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Reconcile a run's snapshot with its event log
    Resume {
        run_id: String,
        #[arg(long)]
        plan: PathBuf,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Init { .. } => "init",
            Commands::Status { .. } => "status",
            Commands::Check { .. } => "check",
            Commands::Verify { .. } => "verify",
            Commands::Resume { .. } => "resume",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Commands::Init { run_id, .. }
            | Commands::Status { run_id, .. }
            | Commands::Check { run_id, .. }
            | Commands::Verify { run_id, .. }
            | Commands::Resume { run_id, .. } => run_id,
        }
    }
}
