//! Shared fixtures: scripted gateway, fault-injecting store and runners.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mailflow_core::config::DispatchConfig;
use mailflow_core::db::{JobStore, MemoryJobStore};
use mailflow_core::error::{ErrorCode, MailflowError, Result};
use mailflow_core::gateway::{DeliveryGateway, GatewayError, OutboundEmail};
use mailflow_core::jobs::{
    Content, ContentId, DeliveryEvent, DispatchSummary, Dispatcher, HandoffQueue, JobId,
    JobStatus, MailJob, Scheduler, SendPool, TickReport, TokenBucket,
};

// ============================================================================
// Scripted gateway
// ============================================================================

/// One observed gateway call.
#[derive(Debug, Clone)]
pub struct Call {
    pub job_id: JobId,
    pub recipient: String,
    pub subject: String,
    pub html_body: String,
    pub at: Instant,
}

/// Holds every gated send until [`Gate::open`] is called.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn open(&self) {
        self.0.close();
    }
}

/// Gateway whose behavior is chosen per recipient.
#[derive(Default)]
pub struct ScriptedGateway {
    fail_for: HashSet<String>,
    panic_for: HashSet<String>,
    hang_for: HashSet<String>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, recipient: &str) -> Self {
        self.fail_for.insert(recipient.to_string());
        self
    }

    pub fn panicking_for(mut self, recipient: &str) -> Self {
        self.panic_for.insert(recipient.to_string());
        self
    }

    /// Never answer for this recipient.
    pub fn hanging_for(mut self, recipient: &str) -> Self {
        self.hang_for.insert(recipient.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn gated(mut self) -> (Self, Gate) {
        let semaphore = Arc::new(Semaphore::new(0));
        self.gate = Some(semaphore.clone());
        (self, Gate(semaphore))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryGateway for ScriptedGateway {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, GatewayError> {
        mailflow_core::gateway::validate(email)?;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let recipient = email.recipients[0].clone();
        self.calls.lock().push(Call {
            job_id: email.correlation_id,
            recipient: recipient.clone(),
            subject: email.subject.clone(),
            html_body: email.html_body.clone(),
            at: Instant::now(),
        });

        if let Some(gate) = &self.gate {
            // Err once the gate is closed, which is the release signal.
            let _ = gate.acquire().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.hang_for.contains(&recipient) {
            std::future::pending::<()>().await;
        }
        if self.panic_for.contains(&recipient) {
            panic!("gateway exploded for {}", recipient);
        }
        if self.fail_for.contains(&recipient) {
            return Err(GatewayError::Rejected(format!(
                "mailbox unavailable: {}",
                recipient
            )));
        }
        Ok(format!("msg-{}", email.correlation_id))
    }
}

// ============================================================================
// Instrumented store
// ============================================================================

/// Memory store wrapper that counts lookups and injects faults.
#[derive(Clone, Default)]
pub struct InstrumentedStore {
    pub inner: MemoryJobStore,
    fail_claims: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
    panic_writes: Arc<AtomicBool>,
    content_lookups: Arc<AtomicU64>,
    claims: Arc<AtomicU64>,
}

impl InstrumentedStore {
    pub fn new(inner: MemoryJobStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Fail the next `n` claims.
    pub fn fail_next_claims(&self, n: usize) {
        self.fail_claims.store(n, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn panic_writes(&self, panic: bool) {
        self.panic_writes.store(panic, Ordering::SeqCst);
    }

    pub fn content_lookups(&self) -> u64 {
        self.content_lookups.load(Ordering::SeqCst)
    }

    pub fn claims(&self) -> u64 {
        self.claims.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for InstrumentedStore {
    async fn claim_batch(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<MailJob>> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .fail_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(MailflowError::new(
                ErrorCode::DatabaseQueryFailed,
                "connection reset by peer",
            ));
        }
        self.inner.claim_batch(limit, now).await
    }

    async fn update_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        provider_message_id: Option<&str>,
        error_text: Option<&str>,
    ) -> Result<()> {
        if self.panic_writes.load(Ordering::SeqCst) {
            panic!("store exploded writing job {}", job_id);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MailflowError::new(
                ErrorCode::DatabaseQueryFailed,
                "write rejected",
            ));
        }
        self.inner
            .update_terminal(job_id, status, provider_message_id, error_text)
            .await
    }

    async fn get_content(&self, content_id: ContentId) -> Result<Option<Content>> {
        self.content_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_content(content_id).await
    }

    async fn append_event(&self, event: DeliveryEvent) -> Result<()> {
        self.inner.append_event(event).await
    }
}

// ============================================================================
// Runners
// ============================================================================

/// Dispatch settings with the first tick at startup.
pub fn dispatch_config(rate: u32, max_concurrent: usize) -> DispatchConfig {
    DispatchConfig {
        rate_per_second: rate,
        max_concurrent: Some(max_concurrent),
        run_immediately: true,
        ..DispatchConfig::default()
    }
}

/// Dispatcher plus the pieces a test may want to observe.
pub struct DispatchHarness {
    pub cancel: CancellationToken,
    pub scheduler: Scheduler,
    pub pool: Arc<SendPool>,
    pub dispatcher: tokio::task::JoinHandle<DispatchSummary>,
}

/// Spawn a dispatcher and build a scheduler feeding it. Nothing is claimed yet.
pub fn spawn_dispatcher(
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn DeliveryGateway>,
    config: &DispatchConfig,
) -> DispatchHarness {
    let cancel = CancellationToken::new();
    let (sender, receiver) = HandoffQueue::new(config.queue_capacity);
    let pool = Arc::new(SendPool::new(config.effective_max_concurrent()));
    let dispatcher = Dispatcher::new(
        receiver,
        store.clone(),
        gateway,
        Arc::new(TokenBucket::per_second(config.rate_per_second)),
        pool.clone(),
        config,
    );
    DispatchHarness {
        dispatcher: tokio::spawn(dispatcher.run(cancel.clone())),
        scheduler: Scheduler::new(store, config, sender),
        pool,
        cancel,
    }
}

/// Run one tick, then let the dispatcher finish everything it received.
pub async fn run_once(
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn DeliveryGateway>,
    config: &DispatchConfig,
) -> (TickReport, DispatchSummary) {
    let harness = spawn_dispatcher(store, gateway, config);
    let tick = harness.scheduler.run_tick(&harness.cancel).await;
    // Dropping the scheduler closes the queue; the dispatcher exits once empty.
    drop(harness.scheduler);
    let summary = harness.dispatcher.await.expect("dispatcher task panicked");
    (tick, summary)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// True when `history` is a prefix of Created, InFlight, Sent|Failed.
pub fn is_forward_history(history: &[JobStatus]) -> bool {
    let expected = [JobStatus::Created, JobStatus::InFlight];
    history.iter().enumerate().all(|(i, status)| match i {
        0 | 1 => *status == expected[i],
        2 => matches!(status, JobStatus::Sent | JobStatus::Failed),
        _ => false,
    })
}
