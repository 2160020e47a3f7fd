use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use review_pulse::models::WeightPolicy;
use review_pulse::orchestrator::ControlSignal;

mod cmd;

#[derive(Parser)]
#[command(name = "review-pulse")]
#[command(version, about = "Durable paginated review sentiment aggregation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Worker API address (e.g. "http://127.0.0.1:7340"). Overrides pulse.toml and PULSE_WORKER_URL.
    #[arg(long, global = true)]
    pub worker_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker: host runs and serve the control API
    Worker {
        /// Port to listen on (overrides [worker].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides [worker].bind)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Start a new aggregation run for a product
    Start {
        /// Source (product) identifier
        source_id: String,

        /// Stop after this many records
        #[arg(short = 'n', long)]
        max_records: Option<u64>,

        #[arg(long)]
        page_size: Option<u32>,

        /// uniform | content_length
        #[arg(long)]
        weight_policy: Option<WeightPolicy>,

        /// Language code passed to the sentiment service
        #[arg(long)]
        language: Option<String>,

        /// Follow progress until the run finishes
        #[arg(short, long)]
        wait: bool,
    },
    /// Show the progress snapshot of a run
    Progress {
        run_id: String,

        /// Poll until the run reaches a terminal state
        #[arg(short, long)]
        watch: bool,

        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },
    /// Pause a running run at its next page boundary
    Pause { run_id: String },
    /// Resume a paused run
    Resume { run_id: String },
    /// Cancel a run at its next safe point
    Cancel { run_id: String },
    /// List recent runs
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration
    Validate,
    /// Create a default pulse.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Worker { port, bind } => {
            cmd::cmd_worker(&cli, project_dir, *port, bind.clone()).await?;
        }
        Commands::Start {
            source_id,
            max_records,
            page_size,
            weight_policy,
            language,
            wait,
        } => {
            let request = review_pulse::worker::StartRun {
                source_id: source_id.clone(),
                max_records: *max_records,
                page_size: *page_size,
                weight_policy: *weight_policy,
                language_code: language.clone(),
            };
            cmd::cmd_start(&cli, project_dir, request, *wait).await?;
        }
        Commands::Progress {
            run_id,
            watch,
            json,
        } => cmd::cmd_progress(&cli, project_dir, run_id, *watch, *json).await?,
        Commands::Pause { run_id } => {
            cmd::cmd_signal(&cli, project_dir, run_id, ControlSignal::Pause).await?
        }
        Commands::Resume { run_id } => {
            cmd::cmd_signal(&cli, project_dir, run_id, ControlSignal::Resume).await?
        }
        Commands::Cancel { run_id } => {
            cmd::cmd_signal(&cli, project_dir, run_id, ControlSignal::Cancel).await?
        }
        Commands::List { limit } => cmd::cmd_list(&cli, project_dir, *limit).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
