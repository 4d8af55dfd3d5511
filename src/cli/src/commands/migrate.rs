//! Apply database migrations.

use anyhow::{Context, Result};
use mailflow_core::db::PgJobStore;

use crate::output;

pub async fn execute(store: &PgJobStore) -> Result<()> {
    store.migrate().await.context("Migration failed")?;
    output::print_success("Database schema is up to date");
    Ok(())
}
