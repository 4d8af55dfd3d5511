//! Bounded hand-off queue between the scheduler and the dispatcher.
//!
//! A full queue suspends the scheduler's push, which is how a saturated
//! dispatcher slows intake. Items are never dropped on push; whatever is still
//! queued when the dispatcher exits is dropped with the receiver.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::job::ClaimedJob;
use crate::telemetry::PipelineMetrics;

/// Why a push did not enqueue the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("shutdown requested while waiting for queue capacity")]
    Cancelled,
    #[error("hand-off queue receiver dropped")]
    Closed,
}

/// Constructor for the queue halves.
pub struct HandoffQueue;

impl HandoffQueue {
    /// Create a queue holding at most `capacity` jobs.
    pub fn new(capacity: usize) -> (HandoffSender, HandoffReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (HandoffSender { tx }, HandoffReceiver { rx })
    }
}

/// Producer half, held by the scheduler.
#[derive(Debug, Clone)]
pub struct HandoffSender {
    tx: mpsc::Sender<ClaimedJob>,
}

impl HandoffSender {
    /// Push a job, waiting for capacity unless `cancel` fires first.
    pub async fn push(&self, job: ClaimedJob, cancel: &CancellationToken) -> Result<(), PushError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PushError::Cancelled),
            sent = self.tx.send(job) => {
                PipelineMetrics::set_queue_depth(self.depth());
                sent.map_err(|_| PushError::Closed)
            }
        }
    }

    /// Jobs currently buffered.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, held by the dispatcher.
#[derive(Debug)]
pub struct HandoffReceiver {
    rx: mpsc::Receiver<ClaimedJob>,
}

impl HandoffReceiver {
    /// Next job, or `None` once every sender is gone and the queue is empty.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<ClaimedJob> {
        let job = self.rx.recv().await;
        PipelineMetrics::set_queue_depth(self.rx.len());
        job
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Stop accepting pushes. Buffered jobs can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
