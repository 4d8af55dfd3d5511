//! Dispatcher: drains the hand-off queue into rate- and concurrency-bounded sends.
//!
//! Admission takes a rate token first, then a pool slot. Each admitted job is
//! sent on its own task; the task contains any panic from the send, writes the
//! terminal status and reports a [`SendOutcome`] back to the dispatcher.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::job::{ClaimedJob, DeliveryEvent, JobId, JobStatus};
use super::pool::SendPool;
use super::queue::HandoffReceiver;
use super::rate_limit::TokenBucket;
use crate::config::DispatchConfig;
use crate::db::JobStore;
use crate::gateway::{DeliveryGateway, GatewayError, OutboundEmail};
use crate::telemetry::{PipelineMetrics, SendOutcomeLabel, SensitiveFieldRedactor};

/// Terminal result of one send unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Failed,
}

/// Counters reported when the dispatcher exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub admitted: u64,
    pub sent: u64,
    pub failed: u64,
    /// Sends that completed while shutdown was draining
    pub drained: u64,
    /// Sends aborted at the drain timeout; their jobs stay InFlight
    pub abandoned: u64,
    /// Jobs received but never admitted; their jobs stay InFlight
    pub dropped_queued: u64,
}

impl DispatchSummary {
    fn record(&mut self, joined: Result<SendOutcome, JoinError>) {
        match joined {
            Ok(SendOutcome::Sent) => self.sent += 1,
            Ok(SendOutcome::Failed) => self.failed += 1,
            Err(err) if err.is_cancelled() => self.abandoned += 1,
            Err(err) => {
                tracing::error!(error = %err, "Send task terminated abnormally");
                self.failed += 1;
            }
        }
    }
}

/// Snapshot of one reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

impl WindowSnapshot {
    pub fn is_empty(&self) -> bool {
        self.sent == 0 && self.failed == 0
    }

    /// Successful sends per second over the window.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.sent as f64 / secs
    }
}

#[derive(Debug)]
struct WindowState {
    sent: u64,
    failed: u64,
    started: Instant,
}

/// Rolling sent/failed counters, reset on every [`ThroughputWindow::take`].
#[derive(Debug)]
pub struct ThroughputWindow {
    state: Mutex<WindowState>,
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputWindow {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                sent: 0,
                failed: 0,
                started: Instant::now(),
            }),
        }
    }

    pub fn record(&self, outcome: SendOutcome) {
        let mut state = self.state.lock();
        match outcome {
            SendOutcome::Sent => state.sent += 1,
            SendOutcome::Failed => state.failed += 1,
        }
    }

    /// Return the current window and start a new one.
    pub fn take(&self) -> WindowSnapshot {
        let mut state = self.state.lock();
        let now = Instant::now();
        let snapshot = WindowSnapshot {
            sent: state.sent,
            failed: state.failed,
            elapsed: now.duration_since(state.started),
        };
        state.sent = 0;
        state.failed = 0;
        state.started = now;
        snapshot
    }
}

/// Append the open-tracking pixel for `job_id` to an HTML body.
pub fn with_tracking_pixel(body: &str, base_url: &str, job_id: JobId) -> String {
    format!(
        "{}<img src=\"{}/v1/events/open?requestId={}\" width=\"1\" height=\"1\" alt=\"\" />",
        body,
        base_url.trim_end_matches('/'),
        job_id
    )
}

/// State shared by every send task.
struct SendContext {
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn DeliveryGateway>,
    send_timeout: Duration,
    tracking_base_url: String,
    window: Arc<ThroughputWindow>,
}

impl SendContext {
    async fn attempt(&self, claimed: &ClaimedJob) -> Result<String, GatewayError> {
        let job = &claimed.job;
        let email = OutboundEmail {
            correlation_id: job.id,
            subject: claimed.content.subject.clone(),
            html_body: with_tracking_pixel(&claimed.content.body, &self.tracking_base_url, job.id),
            recipients: vec![job.recipient.clone()],
        };

        match tokio::time::timeout(self.send_timeout, self.gateway.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.send_timeout)),
        }
    }

    async fn write_back(&self, job_id: JobId, result: &Result<String, String>) {
        let (status, message_id, error, event) = match result {
            Ok(message_id) => (
                JobStatus::Sent,
                Some(message_id.as_str()),
                None,
                DeliveryEvent::sent(job_id, message_id),
            ),
            Err(error) => (
                JobStatus::Failed,
                None,
                Some(error.as_str()),
                DeliveryEvent::failed(job_id, error),
            ),
        };

        if let Err(err) = self.store.update_terminal(job_id, status, message_id, error).await {
            tracing::error!(job_id = %job_id, status = %status, error = %err, "Status write-back failed");
            return;
        }
        if let Err(err) = self.store.append_event(event).await {
            tracing::warn!(job_id = %job_id, error = %err, "Delivery event append failed");
        }
    }
}

/// One send unit. Never panics outward: a send fault becomes a Failed
/// outcome, a write-back fault leaves the job InFlight.
async fn deliver(
    ctx: Arc<SendContext>,
    claimed: ClaimedJob,
    permit: super::pool::SendPermit,
) -> SendOutcome {
    let job_id = claimed.job.id;
    let started = Instant::now();

    let attempt = AssertUnwindSafe(ctx.attempt(&claimed)).catch_unwind().await;
    let elapsed = started.elapsed();

    let (label, result) = match attempt {
        Ok(Ok(message_id)) => (SendOutcomeLabel::Sent, Ok(message_id)),
        Ok(Err(err)) => {
            let label = match err {
                GatewayError::Timeout(_) => SendOutcomeLabel::Timeout,
                _ => SendOutcomeLabel::Failed,
            };
            (label, Err(err.to_string()))
        }
        Err(panic) => (
            SendOutcomeLabel::Panicked,
            Err(format!("send panicked: {}", panic_message(&*panic))),
        ),
    };
    PipelineMetrics::record_send(label, elapsed);

    match &result {
        Ok(message_id) => {
            tracing::debug!(job_id = %job_id, message_id = %message_id, elapsed = ?elapsed, "Email sent");
        }
        Err(error) => {
            let redacted = SensitiveFieldRedactor::global().redact_value(error);
            tracing::warn!(job_id = %job_id, outcome = label.as_str(), error = %redacted, "Email send failed");
        }
    }

    if let Err(panic) = AssertUnwindSafe(ctx.write_back(job_id, &result)).catch_unwind().await {
        tracing::error!(
            job_id = %job_id,
            panic = %panic_message(&*panic),
            "Status write-back panicked, job left in flight"
        );
    }

    let outcome = if result.is_ok() {
        permit.mark_success();
        SendOutcome::Sent
    } else {
        permit.mark_failure();
        SendOutcome::Failed
    };
    ctx.window.record(outcome);
    outcome
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Consumes the hand-off queue until cancelled.
pub struct Dispatcher {
    receiver: HandoffReceiver,
    limiter: Arc<TokenBucket>,
    pool: Arc<SendPool>,
    ctx: Arc<SendContext>,
    drain_timeout: Duration,
    report_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        receiver: HandoffReceiver,
        store: Arc<dyn JobStore>,
        gateway: Arc<dyn DeliveryGateway>,
        limiter: Arc<TokenBucket>,
        pool: Arc<SendPool>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            receiver,
            limiter,
            pool,
            ctx: Arc::new(SendContext {
                store,
                gateway,
                send_timeout: config.send_timeout,
                tracking_base_url: config.tracking_base_url.clone(),
                window: Arc::new(ThroughputWindow::new()),
            }),
            drain_timeout: config.drain_timeout,
            report_interval: config.report_interval,
        }
    }

    /// Dispatch until `cancel` fires or every queue sender is gone, then
    /// drain admitted sends.
    pub async fn run(mut self, cancel: CancellationToken) -> DispatchSummary {
        let mut tasks: JoinSet<SendOutcome> = JoinSet::new();
        let mut summary = DispatchSummary::default();
        let mut reporter =
            tokio::time::interval_at(Instant::now() + self.report_interval, self.report_interval);
        reporter.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            rate_per_second = self.limiter.capacity(),
            max_concurrent = self.pool.max_concurrent(),
            send_timeout = ?self.ctx.send_timeout,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next() => summary.record(joined),
                _ = reporter.tick() => self.report_throughput(),
                next = self.receiver.recv() => {
                    let Some(claimed) = next else {
                        tracing::info!("Hand-off queue closed");
                        break;
                    };
                    if !self.admit(claimed, &cancel, &mut tasks).await {
                        summary.dropped_queued += 1;
                        break;
                    }
                    summary.admitted += 1;
                }
            }
        }

        // Stop admitting. Whatever is still queued is dropped with the receiver.
        self.pool.close();
        self.receiver.close();
        summary.dropped_queued += self.receiver.len() as u64;

        self.drain(&mut tasks, &mut summary).await;
        self.report_throughput();

        tracing::info!(
            admitted = summary.admitted,
            sent = summary.sent,
            failed = summary.failed,
            drained = summary.drained,
            abandoned = summary.abandoned,
            dropped_queued = summary.dropped_queued,
            "Dispatcher stopped"
        );
        summary
    }

    /// Wait for a rate token and a pool slot, then spawn the send.
    ///
    /// Returns false if shutdown won the race; the job is then not sent.
    async fn admit(
        &self,
        claimed: ClaimedJob,
        cancel: &CancellationToken,
        tasks: &mut JoinSet<SendOutcome>,
    ) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = self.limiter.acquire() => {}
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            permit = self.pool.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        tasks.spawn(deliver(self.ctx.clone(), claimed, permit));
        true
    }

    async fn drain(&self, tasks: &mut JoinSet<SendOutcome>, summary: &mut DispatchSummary) {
        if tasks.is_empty() {
            return;
        }

        tracing::info!(in_flight = tasks.len(), timeout = ?self.drain_timeout, "Draining in-flight sends");
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if joined.is_ok() {
                    summary.drained += 1;
                }
                summary.record(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = tasks.len(), "Drain timed out, aborting remaining sends");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                summary.record(joined);
            }
        }
    }

    fn report_throughput(&self) {
        let window = self.ctx.window.take();
        if window.is_empty() {
            return;
        }
        tracing::info!(
            sent = window.sent,
            failed = window.failed,
            elapsed = ?window.elapsed,
            rate = window.rate(),
            "Dispatch throughput"
        );
    }
}
