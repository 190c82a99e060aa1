//! `spot-agent` command line

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use spot_agent::logging::init_logging;
use spot_agent::runtime::{self, RunOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "spot-agent")]
#[command(about = "Autonomous spot trading agent")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "spot-agent.toml")]
    config: PathBuf,

    /// Log as JSON objects
    #[arg(long, global = true)]
    log_json: bool,

    /// Also log into daily files under this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trade until interrupted
    Run {
        /// Print stage transitions on stdout
        #[arg(long)]
        console: bool,
        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Walk every stage once without side effects
    DryRun {
        /// Print stage transitions on stdout
        #[arg(long)]
        console: bool,
    },
    /// Create or update the database schema
    Migrate,
    /// Run the startup checks; exit 1 if any fails
    Doctor {
        /// Skip the exchange check
        #[arg(long)]
        offline: bool,
    },
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let cfg = runtime::load_config(&cli.config)?;
    match cli.command {
        Commands::Run { console, max_cycles } => {
            let opts = RunOptions {
                console,
                max_cycles,
                no_stream: false,
            };
            runtime::run(cfg, &opts).await?;
        }
        Commands::DryRun { console } => {
            let report = runtime::dry_run(&cfg, console).await?;
            println!("{} {} {} stages", report.run_id, report.cycle_id, report.stages);
        }
        Commands::Migrate => {
            runtime::migrate(&cfg).await?.close().await;
        }
        Commands::Doctor { offline } => {
            let report = runtime::doctor(&cfg, offline).await?;
            print!("{report}");
            if !report.passed() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_json, cli.log_dir.as_deref());
    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
