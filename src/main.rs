mod config;
mod core;
mod export;
mod models;
mod providers;
mod roster;
mod storage;

use std::path::PathBuf;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::core::harvester::HarvestOptions;
use crate::core::runtime::{Runtime, Worker};

/// Collects timelines, follower snapshots, and live posts for a fixed roster
/// of accounts.
#[derive(Parser)]
#[command(name = "roster-harvester")]
#[command(about = "Social media harvester for a fixed roster of accounts")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk every roster timeline back to the oldest reachable post
    Harvest {
        /// Roster index to start from
        #[arg(long, default_value = "0")]
        start: usize,

        /// Stop after this many accounts
        #[arg(long)]
        max_accounts: Option<usize>,
    },

    /// Take daily follower snapshots
    Followers,

    /// Classify and store the realtime stream
    Stream,

    /// Fill delayed like counts on streamed content
    Update,

    /// Followers, stream and updater together
    Run,

    /// Dump harvested timelines to CSV
    Export {
        #[arg(long, default_value = "tweets/timelines.csv")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "roster_harvester=debug,info"
    } else {
        "roster_harvester=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::from_env()?;
    let runtime = Runtime::from_config(&config).await?;
    runtime.shutdown_on_ctrl_c();

    match cli.command {
        Commands::Harvest { start, max_accounts } => {
            let options = HarvestOptions {
                start,
                max_accounts,
                ..HarvestOptions::default()
            };
            let report = runtime.harvest(&options).await;
            info!(accounts = report.accounts.len(), total = report.total, "Harvest complete");
            Ok(())
        }
        Commands::Followers => runtime.run_workers(&[Worker::Followers]).await,
        Commands::Stream => runtime.run_workers(&[Worker::Stream]).await,
        Commands::Update => runtime.run_workers(&[Worker::Updater]).await,
        Commands::Run => runtime.run_workers(&Worker::ALL).await,
        Commands::Export { output } => {
            let rows = runtime.export(&output).await?;
            info!(rows, output = %output.display(), "Export complete");
            Ok(())
        }
    }
}
