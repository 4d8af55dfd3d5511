//! Create a content row and one job per recipient.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use mailflow_core::db::JobAdmin;
use mailflow_core::jobs::NewMessage;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct EnqueueArgs {
    /// Subject line
    #[arg(short, long)]
    subject: String,

    /// HTML body
    #[arg(short, long, conflicts_with = "body_file")]
    body: Option<String>,

    /// Read the HTML body from a file
    #[arg(long)]
    body_file: Option<String>,

    /// Recipient address (repeatable, or comma separated)
    #[arg(long = "to", required = true, value_delimiter = ',')]
    recipients: Vec<String>,

    /// Topic used for reporting
    #[arg(long, default_value = "")]
    topic: String,

    /// Send no earlier than this RFC 3339 timestamp
    #[arg(long)]
    at: Option<DateTime<Utc>>,
}

pub async fn execute(args: EnqueueArgs, admin: &dyn JobAdmin, format: OutputFormat) -> Result<()> {
    let body = match (args.body, args.body_file) {
        (Some(body), _) => body,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read body file: {}", path))?,
        (None, None) => bail!("one of --body or --body-file is required"),
    };

    let message = NewMessage::new(
        &args.subject,
        &body,
        &args.recipients,
        &args.topic,
        args.at,
        Utc::now(),
    )?;
    let receipt = admin.enqueue(&message).await?;

    match format {
        OutputFormat::Table => {
            output::print_success(&format!("Enqueued {} job(s)", receipt.job_ids.len()));
            output::print_detail("Content ID", &receipt.content_id.to_string());
            if let (Some(first), Some(last)) = (receipt.job_ids.first(), receipt.job_ids.last()) {
                output::print_detail("Job IDs", &format!("{}..={}", first, last));
            }
            if let Some(at) = message.scheduled_at() {
                output::print_detail("Scheduled", &at.to_rfc3339());
            }
        }
        OutputFormat::Json => output::print_item(&receipt)?,
    }
    Ok(())
}
