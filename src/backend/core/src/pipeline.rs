//! Pipeline context: one scheduler, one dispatcher and the state they share.
//!
//! Everything the two halves share (queue, token bucket, send pool,
//! cancellation) is created in [`Pipeline::start`] and owned by that run, so
//! several pipelines can live in one process.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::db::JobStore;
use crate::error::{MailflowError, Result};
use crate::gateway::DeliveryGateway;
use crate::jobs::{
    DispatchSummary, Dispatcher, HandoffQueue, Scheduler, SchedulerSummary, SendPool,
    SendPoolStats, TokenBucket,
};

/// A configured, not yet running pipeline.
pub struct Pipeline {
    config: DispatchConfig,
    store: Arc<dyn JobStore>,
    gateway: Arc<dyn DeliveryGateway>,
}

impl Pipeline {
    /// Validates `config`; an unusable configuration is fatal here rather than
    /// at the first tick.
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn JobStore>,
        gateway: Arc<dyn DeliveryGateway>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            gateway,
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Spawn the scheduler and dispatcher.
    pub fn start(&self) -> PipelineHandle {
        let cancel = CancellationToken::new();
        let (sender, receiver) = HandoffQueue::new(self.config.queue_capacity);
        let limiter = Arc::new(TokenBucket::per_second(self.config.rate_per_second));
        let pool = Arc::new(SendPool::new(self.config.effective_max_concurrent()));

        let scheduler = Scheduler::new(self.store.clone(), &self.config, sender);
        let dispatcher = Dispatcher::new(
            receiver,
            self.store.clone(),
            self.gateway.clone(),
            limiter,
            pool.clone(),
            &self.config,
        );

        tracing::info!(
            rate_per_second = self.config.rate_per_second,
            quota = self.config.tick_quota(),
            max_concurrent = self.config.effective_max_concurrent(),
            queue_capacity = self.config.queue_capacity,
            "Starting dispatch pipeline"
        );

        PipelineHandle {
            scheduler: tokio::spawn(scheduler.run(cancel.clone())),
            dispatcher: tokio::spawn(dispatcher.run(cancel.clone())),
            cancel,
            pool,
        }
    }
}

/// Final counters of a stopped pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub scheduler: SchedulerSummary,
    pub dispatch: DispatchSummary,
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    scheduler: JoinHandle<SchedulerSummary>,
    dispatcher: JoinHandle<DispatchSummary>,
    pool: Arc<SendPool>,
}

impl PipelineHandle {
    /// Token observed by both halves; cancelling it starts shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pool_stats(&self) -> SendPoolStats {
        self.pool.stats()
    }

    /// Stop intake, drain admitted sends and wait for both halves to exit.
    pub async fn shutdown(self) -> Result<PipelineSummary> {
        tracing::info!("Shutting down dispatch pipeline");
        self.cancel.cancel();

        let scheduler = self
            .scheduler
            .await
            .map_err(|e| MailflowError::internal(format!("scheduler task failed: {}", e)))?;
        let dispatch = self
            .dispatcher
            .await
            .map_err(|e| MailflowError::internal(format!("dispatcher task failed: {}", e)))?;

        Ok(PipelineSummary {
            scheduler,
            dispatch,
        })
    }
}
