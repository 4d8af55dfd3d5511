//! Database access for CLI commands.

use anyhow::{Context, Result};
use mailflow_core::{config::Config, db::PgJobStore};

/// Load configuration the same way the server does and connect.
pub async fn connect(config_path: Option<&str>) -> Result<PgJobStore> {
    let config = match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => Config::load().context("Failed to load configuration from environment")?,
    };

    PgJobStore::connect(&config.database)
        .await
        .context("Failed to connect to database")
}
