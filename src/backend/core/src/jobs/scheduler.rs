//! Periodic claim loop feeding the hand-off queue.
//!
//! Every tick claims at most `rate x interval` due jobs, in batches, resolves
//! their content once per content id and pushes them to the dispatcher. A tick
//! that cannot reach the store is abandoned and the next one starts fresh.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::job::{ClaimedJob, Content, ContentId};
use super::queue::{HandoffSender, PushError};
use crate::config::DispatchConfig;
use crate::db::JobStore;
use crate::telemetry::PipelineMetrics;

/// Result of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs moved to InFlight by this tick
    pub claimed: u64,
    /// Jobs handed to the dispatcher
    pub enqueued: u64,
    /// Claimed jobs whose content could not be resolved
    pub skipped: u64,
    /// Claimed jobs not pushed because the pipeline was shutting down
    pub dropped: u64,
    /// A claim failed and the rest of the tick was abandoned
    pub aborted: bool,
    pub cancelled: bool,
}

/// Totals over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub ticks: u64,
    pub aborted_ticks: u64,
    pub claimed: u64,
    pub enqueued: u64,
    pub skipped: u64,
    pub dropped: u64,
}

impl SchedulerSummary {
    fn record(&mut self, tick: &TickReport) {
        self.ticks += 1;
        if tick.aborted {
            self.aborted_ticks += 1;
        }
        self.claimed += tick.claimed;
        self.enqueued += tick.enqueued;
        self.skipped += tick.skipped;
        self.dropped += tick.dropped;
    }
}

/// Claims due jobs on a fixed interval.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    sender: HandoffSender,
    batch_size: u32,
    quota: u64,
    interval: Duration,
    run_immediately: bool,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, config: &DispatchConfig, sender: HandoffSender) -> Self {
        Self {
            store,
            sender,
            batch_size: config.batch_size,
            quota: config.tick_quota(),
            interval: config.interval,
            run_immediately: config.run_immediately,
        }
    }

    /// Jobs a single tick may claim.
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Tick until `cancel` fires.
    ///
    /// Cancellation is observed between ticks and while waiting on a full
    /// queue. Jobs claimed but not yet pushed at that point stay InFlight.
    pub async fn run(self, cancel: CancellationToken) -> SchedulerSummary {
        let first = if self.run_immediately {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval = ?self.interval,
            quota = self.quota,
            batch_size = self.batch_size,
            "Scheduler started"
        );

        let mut summary = SchedulerSummary::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.run_tick(&cancel).await;
            summary.record(&report);
            if report.cancelled {
                break;
            }
        }

        tracing::info!(
            ticks = summary.ticks,
            claimed = summary.claimed,
            enqueued = summary.enqueued,
            "Scheduler stopped"
        );
        summary
    }

    /// Run one tick: claim up to the quota and push everything claimed.
    pub async fn run_tick(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();
        let mut contents: HashMap<ContentId, Option<Arc<Content>>> = HashMap::new();
        let mut remaining = self.quota;

        while remaining > 0 {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let limit = remaining.min(u64::from(self.batch_size)) as u32;
            let batch = match self.store.claim_batch(limit, Utc::now()).await {
                Ok(batch) => batch,
                Err(err) => {
                    PipelineMetrics::record_claim_error();
                    tracing::error!(error = %err, code = ?err.code(), "Claim failed, abandoning tick");
                    report.aborted = true;
                    break;
                }
            };

            let claimed = batch.len() as u64;
            report.claimed += claimed;
            remaining = remaining.saturating_sub(claimed);
            PipelineMetrics::record_claimed(claimed);

            let mut jobs = batch.into_iter();
            while let Some(job) = jobs.next() {
                let Some(content) = self.resolve_content(&mut contents, job.content_id).await else {
                    tracing::warn!(
                        job_id = %job.id,
                        content_id = %job.content_id,
                        "Content not found, job left in flight"
                    );
                    PipelineMetrics::record_skipped("content_missing");
                    report.skipped += 1;
                    continue;
                };

                match self.sender.push(ClaimedJob { job, content }, cancel).await {
                    Ok(()) => report.enqueued += 1,
                    Err(err) => {
                        report.dropped += 1 + jobs.len() as u64;
                        report.cancelled = true;
                        if err == PushError::Closed {
                            tracing::warn!(dropped = report.dropped, "Dispatcher gone, stopping intake");
                        }
                        return report;
                    }
                }
            }

            // Nothing due, or a zero batch size: either way the tick is over.
            if claimed == 0 || claimed < u64::from(limit) {
                break;
            }
        }

        if report.claimed > 0 || report.aborted {
            tracing::info!(
                claimed = report.claimed,
                enqueued = report.enqueued,
                skipped = report.skipped,
                aborted = report.aborted,
                "Scheduler tick complete"
            );
        } else {
            tracing::debug!("Scheduler tick found no due jobs");
        }
        report
    }

    async fn resolve_content(
        &self,
        cache: &mut HashMap<ContentId, Option<Arc<Content>>>,
        content_id: ContentId,
    ) -> Option<Arc<Content>> {
        if let Some(cached) = cache.get(&content_id) {
            return cached.clone();
        }

        let resolved = match self.store.get_content(content_id).await {
            Ok(content) => content.map(Arc::new),
            Err(err) => {
                tracing::error!(content_id = %content_id, error = %err, "Content lookup failed");
                None
            }
        };
        cache.insert(content_id, resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryJobStore;
    use crate::jobs::job::JobStatus;
    use crate::jobs::queue::HandoffQueue;

    fn config(rate: u32, batch: u32) -> DispatchConfig {
        DispatchConfig {
            rate_per_second: rate,
            batch_size: batch,
            interval: Duration::from_secs(60),
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_tick_claims_quota_in_batches() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        store.seed(content, 100);

        // quota 1 x 60 = 60, batches of 25
        let (tx, rx) = HandoffQueue::new(100);
        let scheduler = Scheduler::new(Arc::new(store.clone()), &config(1, 25), tx);
        let report = scheduler.run_tick(&CancellationToken::new()).await;

        assert_eq!(report.claimed, 60);
        assert_eq!(report.enqueued, 60);
        assert_eq!(rx.len(), 60);
        assert_eq!(store.count(JobStatus::InFlight), 60);
        assert_eq!(store.count(JobStatus::Created), 40);
    }

    #[tokio::test]
    async fn test_tick_stops_when_nothing_due() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        store.seed(content, 7);

        let (tx, rx) = HandoffQueue::new(100);
        let scheduler = Scheduler::new(Arc::new(store.clone()), &config(10, 5), tx);
        let report = scheduler.run_tick(&CancellationToken::new()).await;

        assert_eq!(report.claimed, 7);
        assert_eq!(rx.len(), 7);
        assert!(!report.aborted);
    }

    #[tokio::test]
    async fn test_missing_content_is_skipped() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        let good = store.insert_job(content, "a@x", None);
        let orphan = store.insert_job(ContentId(404), "b@x", None);

        let (tx, mut rx) = HandoffQueue::new(10);
        let scheduler = Scheduler::new(Arc::new(store.clone()), &config(10, 10), tx);
        let report = scheduler.run_tick(&CancellationToken::new()).await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.enqueued, 1);
        assert_eq!(rx.recv().await.unwrap().job.id, good);
        assert_eq!(store.job(orphan).unwrap().status, JobStatus::InFlight);
    }

    #[tokio::test]
    async fn test_cancelled_tick_claims_nothing() {
        let store = MemoryJobStore::new();
        let content = store.insert_content("s", "b");
        store.seed(content, 5);

        let (tx, _rx) = HandoffQueue::new(10);
        let scheduler = Scheduler::new(Arc::new(store.clone()), &config(10, 10), tx);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = scheduler.run_tick(&cancel).await;

        assert!(report.cancelled);
        assert_eq!(report.claimed, 0);
        assert_eq!(store.count(JobStatus::Created), 5);
    }

    #[test]
    fn test_summary_accumulates() {
        let mut summary = SchedulerSummary::default();
        summary.record(&TickReport {
            claimed: 10,
            enqueued: 9,
            skipped: 1,
            ..TickReport::default()
        });
        summary.record(&TickReport {
            aborted: true,
            ..TickReport::default()
        });
        assert_eq!(summary.ticks, 2);
        assert_eq!(summary.aborted_ticks, 1);
        assert_eq!(summary.claimed, 10);
        assert_eq!(summary.skipped, 1);
    }
}
