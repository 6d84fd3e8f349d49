use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ralph_tui::cmd;
use ralph_tui::config::{CliOverrides, Config};
use ralph_tui::errors::RalphError;
use ralph_tui::session::SessionRegistry;

#[derive(Parser)]
#[command(name = "ralph-tui")]
#[command(version, about = "Autonomous task-orchestration harness for coding-agent CLIs")]
pub struct Cli {
    /// Working directory (defaults to the current directory).
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Suppress operator output (orchestration is unchanged).
    #[arg(long, global = true)]
    pub headless: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, clap::Args)]
pub struct SessionArgs {
    /// Tracker plugin id.
    #[arg(long, value_parser = ["json", "beads", "beads-rust", "beads-bv"])]
    pub tracker: Option<String>,

    /// PRD file path (json tracker).
    #[arg(long)]
    pub prd: Option<PathBuf>,

    /// Epic id (bead-based trackers).
    #[arg(long)]
    pub epic: Option<String>,

    /// Agent plugin id.
    #[arg(long)]
    pub agent: Option<String>,

    /// Session-level model override.
    #[arg(long)]
    pub model: Option<String>,

    /// Maximum iteration budget.
    #[arg(long)]
    pub iterations: Option<u32>,

    /// Concurrent workers (>= 1).
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Run inside a session worktree, optionally named.
    #[arg(long, num_args = 0..=1, default_missing_value = "", value_name = "NAME")]
    pub worktree: Option<String>,

    /// Override a live lock.
    #[arg(long)]
    pub force: bool,

    /// Skip the agent preflight probe.
    #[arg(long)]
    pub no_setup: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a session and execute until done or stopped.
    Run {
        #[command(flatten)]
        session: SessionArgs,

        /// Resume the session recorded in this directory.
        #[arg(long)]
        resume: bool,
    },
    /// Resume a previous session, or inspect the registry.
    Resume {
        /// Session id (exact or unique prefix).
        session_id: Option<String>,

        /// List recorded sessions.
        #[arg(long)]
        list: bool,

        /// Drop registry entries whose session file is gone.
        #[arg(long)]
        cleanup: bool,

        #[command(flatten)]
        session: SessionArgs,
    },
}

impl SessionArgs {
    fn into_overrides(self, headless: bool) -> CliOverrides {
        CliOverrides {
            tracker: self.tracker,
            agent: self.agent,
            prd: self.prd,
            epic: self.epic,
            model: self.model,
            iterations: self.iterations,
            parallel: self.parallel,
            worktree: self.worktree.map(|name| {
                if name.is_empty() {
                    None
                } else {
                    Some(name)
                }
            }),
            headless,
            force: self.force,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = cli
        .cwd
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let result = dispatch(cli, cwd).await;
    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn dispatch(cli: Cli, cwd: PathBuf) -> Result<i32, RalphError> {
    let registry = SessionRegistry::open_default()?;
    match cli.command {
        Commands::Run { session, resume } => {
            let no_setup = session.no_setup;
            let config = Config::new(cwd, session.into_overrides(cli.headless))?;
            cmd::cmd_run(config, resume, no_setup, registry).await
        }
        Commands::Resume {
            session_id,
            list,
            cleanup,
            session,
        } => {
            let no_setup = session.no_setup;
            cmd::cmd_resume(
                cwd,
                session_id,
                list,
                cleanup,
                session.into_overrides(cli.headless),
                no_setup,
                registry,
            )
            .await
        }
    }
}
