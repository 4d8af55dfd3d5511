//! PostgreSQL job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use super::{JobAdmin, JobStore, OrphanedJob, INSERT_CHUNK_SIZE};
use crate::config::DatabaseConfig;
use crate::error::{MailflowError, Result};
use crate::jobs::job::{
    Content, ContentId, DeliveryEvent, EnqueueReceipt, JobId, JobStatus, MailJob, NewMessage,
    StatusCounts,
};

/// Job store backed by the `email_*` tables.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Create a new connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_status(&self, job_id: JobId) -> Result<JobStatus> {
        let status: Option<i16> = sqlx::query_scalar("SELECT status FROM email_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?;

        match status {
            Some(code) => JobStatus::try_from(code),
            None => Err(MailflowError::not_found("job", job_id.to_string())),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn claim_batch(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<MailJob>> {
        // SKIP LOCKED lets concurrent claimers partition the due set instead
        // of blocking on each other's rows.
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH due AS (
                SELECT id
                FROM email_jobs
                WHERE status = $1
                  AND (scheduled_at IS NULL OR scheduled_at <= $2)
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE email_jobs AS j
            SET status = $4, updated_at = NOW()
            FROM due
            WHERE j.id = due.id
            RETURNING j.id, j.topic_id, j.recipient, j.content_id, j.scheduled_at,
                      j.status, j.provider_message_id, j.last_error, j.updated_at
            "#,
        )
        .bind(JobStatus::Created.as_i16())
        .bind(now)
        .bind(i64::from(limit))
        .bind(JobStatus::InFlight.as_i16())
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the CTE's ordering.
        let mut jobs = rows
            .into_iter()
            .map(MailJob::try_from)
            .collect::<Result<Vec<_>>>()?;
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn update_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        provider_message_id: Option<&str>,
        error_text: Option<&str>,
    ) -> Result<()> {
        JobStatus::InFlight.transition(job_id, status)?;

        let result = sqlx::query(
            r#"
            UPDATE email_jobs
            SET status = $2, provider_message_id = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(job_id.0)
        .bind(status.as_i16())
        .bind(provider_message_id)
        .bind(error_text)
        .bind(JobStatus::InFlight.as_i16())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.current_status(job_id).await?;
            return Err(MailflowError::invalid_transition(job_id.0, current, status));
        }
        Ok(())
    }

    async fn get_content(&self, content_id: ContentId) -> Result<Option<Content>> {
        let row = sqlx::query_as::<_, ContentRow>(
            "SELECT id, subject, body FROM email_contents WHERE id = $1",
        )
        .bind(content_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Content::from))
    }

    async fn append_event(&self, event: DeliveryEvent) -> Result<()> {
        sqlx::query("INSERT INTO delivery_events (job_id, kind, raw) VALUES ($1, $2, $3)")
            .bind(event.job_id.0)
            .bind(event.kind.as_str())
            .bind(&event.raw)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobAdmin for PgJobStore {
    async fn enqueue(&self, message: &NewMessage) -> Result<EnqueueReceipt> {
        let mut tx = self.pool.begin().await?;

        let content_id: i64 = sqlx::query_scalar(
            "INSERT INTO email_contents (subject, body) VALUES ($1, $2) RETURNING id",
        )
        .bind(message.subject())
        .bind(message.body())
        .fetch_one(&mut *tx)
        .await?;

        let mut job_ids = Vec::with_capacity(message.recipients().len());
        for chunk in message.recipients().chunks(INSERT_CHUNK_SIZE) {
            let ids: Vec<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO email_jobs (topic_id, recipient, content_id, scheduled_at)
                SELECT $1, recipient, $2, $3
                FROM UNNEST($4::text[]) AS recipient
                RETURNING id
                "#,
            )
            .bind(message.topic_id())
            .bind(content_id)
            .bind(message.scheduled_at())
            .bind(chunk)
            .fetch_all(&mut *tx)
            .await?;
            job_ids.extend(ids.into_iter().map(JobId));
        }

        tx.commit().await?;

        job_ids.sort();
        Ok(EnqueueReceipt {
            content_id: ContentId(content_id),
            job_ids,
        })
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE email_jobs SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3",
        )
        .bind(job_id.0)
        .bind(JobStatus::Stopped.as_i16())
        .bind(JobStatus::Created.as_i16())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.current_status(job_id).await?;
            return Err(MailflowError::invalid_transition(
                job_id.0,
                current,
                JobStatus::Stopped,
            ));
        }
        Ok(())
    }

    async fn status_counts(&self, topic_id: Option<&str>) -> Result<StatusCounts> {
        let rows: Vec<(i16, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM email_jobs
            WHERE ($1::text IS NULL OR topic_id = $1)
            GROUP BY status
            "#,
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (code, count) in rows {
            counts.add(JobStatus::try_from(code)?, count);
        }
        Ok(counts)
    }

    async fn stale_in_flight(&self, older_than: DateTime<Utc>, limit: u32) -> Result<Vec<OrphanedJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, topic_id, recipient, content_id, scheduled_at,
                   status, provider_message_id, last_error, updated_at
            FROM email_jobs
            WHERE status = $1 AND updated_at < $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(JobStatus::InFlight.as_i16())
        .bind(older_than)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| OrphanedJob {
                id: JobId(row.id),
                topic_id: row.topic_id,
                recipient: row.recipient,
                claimed_at: row.updated_at,
            })
            .collect())
    }

    async fn sent_count_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM email_jobs WHERE status = $1 AND updated_at >= $2",
        )
        .bind(JobStatus::Sent.as_i16())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    topic_id: String,
    recipient: String,
    content_id: i64,
    scheduled_at: Option<DateTime<Utc>>,
    status: i16,
    provider_message_id: Option<String>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for MailJob {
    type Error = MailflowError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(MailJob {
            id: JobId(row.id),
            topic_id: row.topic_id,
            recipient: row.recipient,
            content_id: ContentId(row.content_id),
            scheduled_at: row.scheduled_at,
            status: JobStatus::try_from(row.status)?,
            provider_message_id: row.provider_message_id,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ContentRow {
    id: i64,
    subject: String,
    body: String,
}

impl From<ContentRow> for Content {
    fn from(row: ContentRow) -> Self {
        Content {
            id: ContentId(row.id),
            subject: row.subject,
            body: row.body,
        }
    }
}
