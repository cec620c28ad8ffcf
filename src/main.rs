use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use weaver::config::WeaverConfig;
use weaver::logging::{self, LoggingOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "weaver")]
#[command(version, about = "AI task orchestrator - inspect sessions, history and tooling")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Project directory containing .weaver/ (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the most recent session
    Status,
    /// Browse persisted sessions
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
    /// Mark sessions as cleared so they can no longer be resumed
    Clean {
        /// Session to clear (defaults to every resumable session)
        id: Option<String>,
    },
    /// Compact a prompt file and report the reduction
    Compact {
        file: PathBuf,
        /// Fraction of the prompt to try to remove
        #[arg(long, default_value = "0.5")]
        target: f64,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a source file for truncated or unbalanced code
    Check { file: PathBuf },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum HistoryCommands {
    /// List sessions, newest first
    List {
        /// Only sessions in this phase (e.g. complete, error, executing)
        #[arg(long)]
        status: Option<String>,
        /// Case-insensitive match on task text or id prefix
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show one session in full
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete a session record
    Delete { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default weaver.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = WeaverConfig::load(&project_dir)?;

    let logging = &config.toml.logging;
    let _guard = logging::init(LoggingOptions {
        verbosity: cli.verbose,
        level: logging.level.clone(),
        json: cli.json_logs || logging.json,
        file_dir: logging.file.then(|| config.log_dir()),
    })?;

    match &cli.command {
        Commands::Status => cmd::cmd_status(&config)?,
        Commands::History { command } => cmd::cmd_history(&config, command.clone())?,
        Commands::Clean { id } => cmd::cmd_clean(&config, id.as_deref())?,
        Commands::Compact { file, target, json } => cmd::cmd_compact(file, *target, *json)?,
        Commands::Check { file } => cmd::cmd_check(file)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
