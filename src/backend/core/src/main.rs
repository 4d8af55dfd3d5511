//! Mailflow Server - runs the claim-and-dispatch pipeline until signalled.

use std::sync::Arc;

use clap::Parser;
use mailflow_core::{
    config::Config,
    db::PgJobStore,
    gateway::SesGateway,
    pipeline::Pipeline,
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "mailflow-server", version, about = "Bulk email dispatch daemon")]
struct Args {
    /// Configuration file; environment variables override its values
    #[arg(short, long, env = "MAILFLOW_CONFIG")]
    config: Option<String>,

    /// Skip running database migrations at startup
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.telemetry.environment,
        "Starting Mailflow Server"
    );

    let store = PgJobStore::connect(&config.database).await?;
    tracing::info!("Connected to database");

    if !args.skip_migrations {
        store.migrate().await?;
        tracing::info!("Database migrations applied");
    }

    let gateway = SesGateway::from_config(&config.gateway).await?;
    tracing::info!(region = %config.gateway.region, "SES gateway ready");

    let pipeline = Pipeline::new(config.dispatch.clone(), Arc::new(store), Arc::new(gateway))?;
    let handle = pipeline.start();

    shutdown_signal().await;

    let summary = handle.shutdown().await?;
    tracing::info!(
        ticks = summary.scheduler.ticks,
        claimed = summary.scheduler.claimed,
        sent = summary.dispatch.sent,
        failed = summary.dispatch.failed,
        abandoned = summary.dispatch.abandoned,
        dropped_queued = summary.dispatch.dropped_queued,
        "Server shutdown complete"
    );

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
