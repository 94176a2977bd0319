use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cotflow")]
#[command(version, about = "Phased chain-of-thought content pipeline orchestrator")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Database path. Overrides cotflow.toml and COTFLOW_DB_PATH.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Task worker pool size. Overrides cotflow.toml and COTFLOW_CONCURRENCY.
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .cotflow/cotflow.toml with the default pipeline
    Init {
        /// Overwrite an existing cotflow.toml
        #[arg(long)]
        force: bool,
    },
    /// Create a session
    Create {
        topic: String,
        #[arg(long, default_value = "informative")]
        style: String,
        #[arg(long, default_value = "linkedin")]
        platform: String,
        /// Extra prompt variables, repeatable
        #[arg(long = "extra", value_name = "KEY=VALUE")]
        extra: Vec<String>,
    },
    /// List sessions, newest first
    List {
        /// Only sessions with this status (e.g. failed, completed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show a session with its phases and task counts
    Status { session_id: String },
    /// Show task counts of a session
    Tasks { session_id: String },
    /// Diagnose a session
    Health { session_id: String },
    /// Apply a recovery action, or the recommended one
    Recover {
        session_id: String,
        /// retry, wait, restart_phase:N, restart_session or abort
        #[arg(long)]
        action: Option<String>,
    },
    /// Run the task queue and scheduler until Ctrl-C
    Run,
    /// Drive one session until it completes or halts
    Drive { session_id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Init { force } = &cli.command {
        return cmd::cmd_init(&project_dir, *force);
    }

    let mut config = cotflow::config::CotflowConfig::with_cli_args(project_dir, cli.db.clone(), cli.concurrency)?;
    if cli.verbose {
        config.toml.logging.level = "debug".to_string();
    }
    let _log_guard = cotflow::logging::init(&config.toml.logging, config.log_dir().as_deref())?;

    match &cli.command {
        Commands::Init { .. } => {}
        Commands::Create {
            topic,
            style,
            platform,
            extra,
        } => cmd::cmd_create(&config, &cli, topic, style, platform, extra).await?,
        Commands::List { status, limit } => {
            cmd::cmd_list(&config, &cli, status.as_deref(), *limit).await?
        }
        Commands::Status { session_id } => cmd::cmd_status(&config, &cli, session_id).await?,
        Commands::Tasks { session_id } => cmd::cmd_tasks(&config, &cli, session_id).await?,
        Commands::Health { session_id } => cmd::cmd_health(&config, &cli, session_id).await?,
        Commands::Recover { session_id, action } => {
            cmd::cmd_recover(&config, &cli, session_id, action.as_deref()).await?
        }
        Commands::Run => cmd::cmd_run(&config).await?,
        Commands::Drive { session_id } => cmd::cmd_drive(&config, &cli, session_id).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
