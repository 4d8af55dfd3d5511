//! Mailflow CLI - operator commands for the dispatch pipeline's job store.
//!
//! Provides migration, ingestion, cancellation and reporting commands.

mod commands;
mod output;
mod store;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{cancel, enqueue, migrate, report};
use output::OutputFormat;

/// Mailflow - bulk email dispatch CLI
#[derive(Parser)]
#[command(
    name = "mailflow",
    version,
    about = "Mailflow - bulk email dispatch",
    long_about = "CLI tool for enqueueing mail jobs and inspecting the dispatch job store.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file; environment variables override its values
    #[arg(short, long, global = true, env = "MAILFLOW_CONFIG")]
    config: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Enqueue one message for one or more recipients
    Enqueue(enqueue::EnqueueArgs),

    /// Job counts per status
    Stats(report::StatsArgs),

    /// Jobs sent within a recent window
    SentCount(report::SentCountArgs),

    /// Cancel jobs that have not been claimed yet
    Cancel(cancel::CancelArgs),

    /// List jobs stuck in flight
    Orphans(report::OrphansArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let result = async {
        let store = store::connect(cli.config.as_deref()).await?;
        match cli.command {
            Commands::Migrate => migrate::execute(&store).await,
            Commands::Enqueue(args) => enqueue::execute(args, &store, format).await,
            Commands::Stats(args) => report::stats(args, &store, format).await,
            Commands::SentCount(args) => report::sent_count(args, &store, format).await,
            Commands::Cancel(args) => cancel::execute(args, &store, format).await,
            Commands::Orphans(args) => report::orphans(args, &store, format).await,
        }
    }
    .await;

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
