//! claimgrid: drive the claim coordinator from the command line.
//!
//! # Usage
//!
//! ```text
//! claimgrid simulate --scenario demos/gpu-inference.toml
//! claimgrid check-config claimgrid.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod scenario;

#[derive(Parser)]
#[command(
    name = "claimgrid",
    about = "ClaimGrid: resource claim coordination for scheduling pipelines",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scheduling attempt for a scenario and print a JSON report.
    Simulate {
        /// Scenario file (TOML).
        #[arg(short, long)]
        scenario: PathBuf,
        /// Coordinator config file; overrides the scenario's [config].
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Cancel the attempt after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Validate a coordinator config file.
    CheckConfig {
        path: PathBuf,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,claimgrid=debug"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    match cli.command {
        Commands::Simulate {
            scenario,
            config,
            timeout,
        } => commands::simulate::simulate(&scenario, config.as_deref(), timeout).await,
        Commands::CheckConfig { path } => commands::check_config::check_config(&path),
    }
}
