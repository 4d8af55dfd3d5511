//! Read-only reports: status counts, recent sends and orphaned jobs.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::*;
use mailflow_core::db::{JobAdmin, OrphanedJob};
use mailflow_core::jobs::JobStatus;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct StatsArgs {
    /// Only count jobs of this topic
    #[arg(short, long)]
    topic: Option<String>,
}

#[derive(Args)]
pub struct SentCountArgs {
    /// Look-back window in hours
    #[arg(long, default_value = "24")]
    hours: u32,
}

#[derive(Args)]
pub struct OrphansArgs {
    /// Minimum time spent in flight, e.g. "10m" or "2h"
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    pub older_than: std::time::Duration,

    /// Maximum number of rows
    #[arg(short, long, default_value = "100")]
    limit: u32,
}

#[derive(Serialize, Tabled)]
struct StatusRow {
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Jobs")]
    count: i64,
}

#[derive(Serialize, Tabled)]
struct OrphanRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Topic")]
    topic: String,
    #[tabled(rename = "Recipient")]
    recipient: String,
    #[tabled(rename = "Claimed At")]
    claimed_at: String,
}

impl From<OrphanedJob> for OrphanRow {
    fn from(job: OrphanedJob) -> Self {
        Self {
            id: job.id.0,
            topic: job.topic_id,
            recipient: job.recipient,
            claimed_at: job.claimed_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct SentCount {
    hours: u32,
    sent: i64,
}

pub async fn stats(args: StatsArgs, admin: &dyn JobAdmin, format: OutputFormat) -> Result<()> {
    let counts = admin.status_counts(args.topic.as_deref()).await?;

    match format {
        OutputFormat::Table => {
            let title = match &args.topic {
                Some(topic) => format!("Jobs for topic '{}'", topic),
                None => "Jobs".to_string(),
            };
            output::print_header(&title);
            let rows: Vec<StatusRow> = JobStatus::ALL
                .iter()
                .map(|status| StatusRow {
                    status: status.to_string(),
                    count: counts.get(*status),
                })
                .collect();
            output::print_list(&rows, format)?;
            output::print_detail("Total", &counts.total().to_string());
        }
        OutputFormat::Json => output::print_item(&counts)?,
    }
    Ok(())
}

pub async fn sent_count(args: SentCountArgs, admin: &dyn JobAdmin, format: OutputFormat) -> Result<()> {
    let since = Utc::now() - chrono::Duration::hours(i64::from(args.hours));
    let sent = admin.sent_count_since(since).await?;

    match format {
        OutputFormat::Table => {
            output::print_detail(&format!("Sent in the last {}h", args.hours), &sent.to_string());
        }
        OutputFormat::Json => output::print_item(&SentCount {
            hours: args.hours,
            sent,
        })?,
    }
    Ok(())
}

/// Lists InFlight jobs that have not reached a terminal status; never modifies them.
pub async fn orphans(args: OrphansArgs, admin: &dyn JobAdmin, format: OutputFormat) -> Result<()> {
    let older_than = chrono::Duration::from_std(args.older_than)
        .context("--older-than is out of range")?;
    let jobs = admin
        .stale_in_flight(Utc::now() - older_than, args.limit)
        .await?;

    if matches!(format, OutputFormat::Table) && !jobs.is_empty() {
        output::print_info(&format!(
            "{} job(s) in flight for more than {}",
            jobs.len(),
            humantime::format_duration(args.older_than)
        ));
        println!(
            "{}",
            "These jobs will not be retried automatically.".yellow()
        );
    }

    let rows: Vec<OrphanRow> = jobs.into_iter().map(OrphanRow::from).collect();
    output::print_list(&rows, format)
}
