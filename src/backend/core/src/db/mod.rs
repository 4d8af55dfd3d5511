//! Job store boundary.
//!
//! [`JobStore`] is everything the scheduler and dispatcher need from
//! persistence. [`JobAdmin`] adds the operator-side operations (ingestion,
//! cancellation, reporting) used by the CLI. PostgreSQL is the production
//! backend; [`MemoryJobStore`] implements the same contract in-process.

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::jobs::job::{
    Content, ContentId, DeliveryEvent, EnqueueReceipt, JobId, JobStatus, MailJob, NewMessage,
    StatusCounts,
};

/// Rows per INSERT statement when creating jobs.
pub const INSERT_CHUNK_SIZE: usize = 1000;

/// Persistence operations used by the pipeline.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically claim up to `limit` due jobs, moving them Created -> InFlight.
    ///
    /// A job is due when its schedule time is absent or not after `now`.
    /// Results are ordered by ascending id. Concurrent callers never receive
    /// the same job.
    async fn claim_batch(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<MailJob>>;

    /// Record the outcome of a send. Only InFlight -> {Sent, Failed} is accepted.
    async fn update_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        provider_message_id: Option<&str>,
        error_text: Option<&str>,
    ) -> Result<()>;

    async fn get_content(&self, content_id: ContentId) -> Result<Option<Content>>;

    /// Append an outcome or callback record. Never deduplicated.
    async fn append_event(&self, event: DeliveryEvent) -> Result<()>;
}

/// A job stuck in InFlight since `claimed_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedJob {
    pub id: JobId,
    pub topic_id: String,
    pub recipient: String,
    pub claimed_at: DateTime<Utc>,
}

/// Operator-side operations.
#[async_trait]
pub trait JobAdmin: Send + Sync {
    /// Create one content and one Created job per recipient, all or nothing.
    async fn enqueue(&self, message: &NewMessage) -> Result<EnqueueReceipt>;

    /// Cancel a job that has not been claimed yet (Created -> Stopped).
    async fn cancel(&self, job_id: JobId) -> Result<()>;

    async fn status_counts(&self, topic_id: Option<&str>) -> Result<StatusCounts>;

    /// InFlight jobs last touched before `older_than`. Read-only.
    async fn stale_in_flight(&self, older_than: DateTime<Utc>, limit: u32) -> Result<Vec<OrphanedJob>>;

    /// Jobs that reached Sent at or after `since`.
    async fn sent_count_since(&self, since: DateTime<Utc>) -> Result<i64>;
}
