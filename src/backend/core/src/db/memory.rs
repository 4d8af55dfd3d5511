//! In-process job store.
//!
//! Implements the same contract as [`super::PgJobStore`] behind one mutex, so a
//! claim is atomic with respect to every other operation. Used by the test
//! suites and for dry runs without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{JobAdmin, JobStore, OrphanedJob};
use crate::error::{MailflowError, Result};
use crate::jobs::job::{
    Content, ContentId, DeliveryEvent, EnqueueReceipt, JobId, JobStatus, MailJob, NewMessage,
    StatusCounts,
};

#[derive(Debug)]
struct JobRecord {
    job: MailJob,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    contents: BTreeMap<ContentId, Content>,
    jobs: BTreeMap<JobId, JobRecord>,
    events: Vec<DeliveryEvent>,
    /// Every status a job has been observed in, in order
    history: BTreeMap<JobId, Vec<JobStatus>>,
    next_content_id: i64,
    next_job_id: i64,
}

impl MemoryState {
    fn set_status(&mut self, job_id: JobId, status: JobStatus, at: DateTime<Utc>) {
        if let Some(record) = self.jobs.get_mut(&job_id) {
            record.job.status = status;
            record.updated_at = at;
        }
        self.history.entry(job_id).or_default().push(status);
    }

    fn insert_content(&mut self, subject: &str, body: &str) -> ContentId {
        self.next_content_id += 1;
        let id = ContentId(self.next_content_id);
        self.contents.insert(
            id,
            Content {
                id,
                subject: subject.to_string(),
                body: body.to_string(),
            },
        );
        id
    }

    fn insert_job(
        &mut self,
        content_id: ContentId,
        recipient: &str,
        topic_id: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> JobId {
        self.next_job_id += 1;
        let id = JobId(self.next_job_id);
        self.jobs.insert(
            id,
            JobRecord {
                job: MailJob {
                    id,
                    topic_id: topic_id.to_string(),
                    recipient: recipient.to_string(),
                    content_id,
                    scheduled_at,
                    status: JobStatus::Created,
                    provider_message_id: None,
                    last_error: None,
                },
                updated_at: Utc::now(),
            },
        );
        self.history.insert(id, vec![JobStatus::Created]);
        id
    }
}

/// In-memory [`JobStore`] and [`JobAdmin`].
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a content row without validation.
    pub fn insert_content(&self, subject: &str, body: &str) -> ContentId {
        self.state.lock().insert_content(subject, body)
    }

    /// Insert a Created job without validation.
    pub fn insert_job(
        &self,
        content_id: ContentId,
        recipient: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> JobId {
        self.state
            .lock()
            .insert_job(content_id, recipient, "", scheduled_at)
    }

    /// Insert `count` immediately-due jobs for one content.
    pub fn seed(&self, content_id: ContentId, count: usize) -> Vec<JobId> {
        let mut state = self.state.lock();
        (0..count)
            .map(|i| state.insert_job(content_id, &format!("user{}@example.com", i), "", None))
            .collect()
    }

    pub fn job(&self, job_id: JobId) -> Option<MailJob> {
        self.state.lock().jobs.get(&job_id).map(|r| r.job.clone())
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|r| r.job.status == status)
            .count()
    }

    pub fn events_for(&self, job_id: JobId) -> Vec<DeliveryEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Statuses observed for a job, oldest first.
    pub fn status_history(&self, job_id: JobId) -> Vec<JobStatus> {
        self.state
            .lock()
            .history
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.state.lock().jobs.keys().copied().collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn claim_batch(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<MailJob>> {
        let mut state = self.state.lock();

        let due: Vec<JobId> = state
            .jobs
            .values()
            .filter(|r| r.job.is_due(now))
            .map(|r| r.job.id)
            .take(limit as usize)
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            state.set_status(id, JobStatus::InFlight, now);
            if let Some(record) = state.jobs.get(&id) {
                claimed.push(record.job.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        provider_message_id: Option<&str>,
        error_text: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        let current = state
            .jobs
            .get(&job_id)
            .map(|r| r.job.status)
            .ok_or_else(|| MailflowError::not_found("job", job_id.to_string()))?;
        if current != JobStatus::InFlight {
            return Err(MailflowError::invalid_transition(job_id.0, current, status));
        }
        current.transition(job_id, status)?;

        if let Some(record) = state.jobs.get_mut(&job_id) {
            record.job.provider_message_id = provider_message_id.map(str::to_string);
            record.job.last_error = error_text.map(str::to_string);
        }
        state.set_status(job_id, status, Utc::now());
        Ok(())
    }

    async fn get_content(&self, content_id: ContentId) -> Result<Option<Content>> {
        Ok(self.state.lock().contents.get(&content_id).cloned())
    }

    async fn append_event(&self, event: DeliveryEvent) -> Result<()> {
        self.state.lock().events.push(event);
        Ok(())
    }
}

#[async_trait]
impl JobAdmin for MemoryJobStore {
    async fn enqueue(&self, message: &NewMessage) -> Result<EnqueueReceipt> {
        let mut state = self.state.lock();
        let content_id = state.insert_content(message.subject(), message.body());
        let job_ids = message
            .recipients()
            .iter()
            .map(|to| state.insert_job(content_id, to, message.topic_id(), message.scheduled_at()))
            .collect();
        Ok(EnqueueReceipt {
            content_id,
            job_ids,
        })
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock();
        let current = state
            .jobs
            .get(&job_id)
            .map(|r| r.job.status)
            .ok_or_else(|| MailflowError::not_found("job", job_id.to_string()))?;
        current.transition(job_id, JobStatus::Stopped)?;
        state.set_status(job_id, JobStatus::Stopped, Utc::now());
        Ok(())
    }

    async fn status_counts(&self, topic_id: Option<&str>) -> Result<StatusCounts> {
        let state = self.state.lock();
        let mut counts = StatusCounts::default();
        for record in state.jobs.values() {
            if topic_id.map_or(true, |t| record.job.topic_id == t) {
                counts.add(record.job.status, 1);
            }
        }
        Ok(counts)
    }

    async fn stale_in_flight(&self, older_than: DateTime<Utc>, limit: u32) -> Result<Vec<OrphanedJob>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|r| r.job.status == JobStatus::InFlight && r.updated_at < older_than)
            .take(limit as usize)
            .map(|r| OrphanedJob {
                id: r.job.id,
                topic_id: r.job.topic_id.clone(),
                recipient: r.job.recipient.clone(),
                claimed_at: r.updated_at,
            })
            .collect())
    }

    async fn sent_count_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let state = self.state.lock();
        let count = state
            .jobs
            .values()
            .filter(|r| r.job.status == JobStatus::Sent && r.updated_at >= since)
            .count();
        Ok(count as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use chrono::Duration;

    #[tokio::test]
    async fn test_claim_is_fifo_and_transitions() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        let ids = store.seed(content, 5);

        let claimed = store.claim_batch(3, Utc::now()).await.unwrap();
        let claimed_ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(claimed_ids, ids[..3]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::InFlight));
        assert_eq!(store.count(JobStatus::Created), 2);
    }

    #[tokio::test]
    async fn test_claim_respects_schedule() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        let now = Utc::now();
        let past = store.insert_job(content, "a@x", Some(now - Duration::minutes(1)));
        let future = store.insert_job(content, "b@x", Some(now + Duration::minutes(1)));
        let unscheduled = store.insert_job(content, "c@x", None);

        let claimed: Vec<_> = store
            .claim_batch(10, now)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(claimed, vec![past, unscheduled]);
        assert_eq!(store.job(future).unwrap().status, JobStatus::Created);
    }

    #[tokio::test]
    async fn test_update_terminal_only_from_in_flight() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        let id = store.insert_job(content, "a@x", None);

        let err = store
            .update_terminal(id, JobStatus::Sent, Some("m"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);

        store.claim_batch(1, Utc::now()).await.unwrap();
        store
            .update_terminal(id, JobStatus::Sent, Some("m-1"), None)
            .await
            .unwrap();
        let job = store.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.provider_message_id.as_deref(), Some("m-1"));

        // second write-back is rejected, status stays Sent
        assert!(store
            .update_terminal(id, JobStatus::Failed, None, Some("late"))
            .await
            .is_err());
        assert_eq!(
            store.status_history(id),
            vec![JobStatus::Created, JobStatus::InFlight, JobStatus::Sent]
        );
    }

    #[tokio::test]
    async fn test_update_terminal_rejects_non_terminal_target() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        let id = store.insert_job(content, "a@x", None);
        store.claim_batch(1, Utc::now()).await.unwrap();

        assert!(store
            .update_terminal(id, JobStatus::Created, None, None)
            .await
            .is_err());
        assert!(store
            .update_terminal(JobId(999), JobStatus::Sent, None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_only_created() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        let a = store.insert_job(content, "a@x", None);
        let b = store.insert_job(content, "b@x", None);

        store.cancel(a).await.unwrap();
        assert_eq!(store.job(a).unwrap().status, JobStatus::Stopped);

        store.claim_batch(10, Utc::now()).await.unwrap();
        let err = store.cancel(b).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);

        // stopped jobs are never claimed
        assert_eq!(store.job(a).unwrap().status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn test_enqueue_and_counts() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let message =
            NewMessage::new("Hi", "<p>x</p>", ["a@x", "b@x", "c@x"], "launch", None, now).unwrap();
        let receipt = store.enqueue(&message).await.unwrap();
        assert_eq!(receipt.job_ids.len(), 3);

        let counts = store.status_counts(Some("launch")).await.unwrap();
        assert_eq!(counts.created, 3);
        assert_eq!(store.status_counts(Some("other")).await.unwrap().total(), 0);

        let content = store.get_content(receipt.content_id).await.unwrap().unwrap();
        assert_eq!(content.subject, "Hi");
    }

    #[tokio::test]
    async fn test_stale_in_flight_detection() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        let id = store.insert_job(content, "a@x", None);
        let claimed_at = Utc::now() - Duration::hours(1);
        store.claim_batch(1, claimed_at).await.unwrap();

        let stale = store
            .stale_in_flight(Utc::now() - Duration::minutes(10), 100)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);
        // detection does not modify the job
        assert_eq!(store.job(id).unwrap().status, JobStatus::InFlight);

        let fresh = store
            .stale_in_flight(Utc::now() - Duration::hours(2), 100)
            .await
            .unwrap();
        assert!(fresh.is_empty());
    }
}
