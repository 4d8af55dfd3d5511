//! Cancel jobs that have not been claimed yet.

use anyhow::Result;
use clap::Args;
use mailflow_core::db::JobAdmin;
use mailflow_core::jobs::{JobId, JobStatus};
use serde::Serialize;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct CancelArgs {
    /// Job IDs to move from Created to Stopped
    #[arg(required = true)]
    job_ids: Vec<i64>,
}

#[derive(Serialize)]
struct CancelResult {
    id: JobId,
    status: Option<JobStatus>,
    error: Option<String>,
}

/// Cancels each id independently; fails if any one could not be cancelled.
pub async fn execute(args: CancelArgs, admin: &dyn JobAdmin, format: OutputFormat) -> Result<()> {
    let mut results = Vec::with_capacity(args.job_ids.len());
    for id in args.job_ids.into_iter().map(JobId) {
        let result = match admin.cancel(id).await {
            Ok(()) => CancelResult {
                id,
                status: Some(JobStatus::Stopped),
                error: None,
            },
            Err(err) => CancelResult {
                id,
                status: None,
                error: Some(err.to_string()),
            },
        };
        results.push(result);
    }

    match format {
        OutputFormat::Table => {
            for result in &results {
                match &result.error {
                    None => output::print_success(&format!("Job {} stopped", result.id)),
                    Some(error) => output::print_error(&format!("Job {}: {}", result.id, error)),
                }
            }
        }
        OutputFormat::Json => output::print_item(&results)?,
    }

    let failures = results.iter().filter(|r| r.error.is_some()).count();
    if failures > 0 {
        anyhow::bail!("{} of {} job(s) could not be cancelled", failures, results.len());
    }
    Ok(())
}
