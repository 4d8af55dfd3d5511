//! Send pool - caps concurrent gateway calls with a tokio Semaphore.
//!
//! Each admitted send owns a [`SendPermit`] for its whole lifetime, including
//! the status write-back. The permit reports its outcome to the pool stats
//! and releases the slot on drop.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ErrorCode, MailflowError, Result};
use crate::telemetry::PipelineMetrics;

/// Permit for one in-flight send.
#[derive(Debug)]
pub struct SendPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
    finished: bool,
}

impl SendPermit {
    pub fn mark_success(mut self) {
        self.finished = true;
        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_failure(mut self) {
        self.finished = true;
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for SendPermit {
    fn drop(&mut self) {
        // Dropped without an outcome: the task was aborted mid-send.
        if !self.finished {
            self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        }
        let now = self.stats.current.fetch_sub(1, Ordering::Relaxed) - 1;
        PipelineMetrics::set_in_flight(now);
    }
}

#[derive(Debug, Default)]
struct PoolStats {
    admitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Concurrency gate for gateway calls.
#[derive(Debug)]
pub struct SendPool {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
}

impl SendPool {
    pub fn new(max_concurrent: usize) -> Self {
        tracing::info!(max_concurrent, "Send pool created");
        Self {
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.stats.current.load(Ordering::Relaxed)
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot.
    ///
    /// Cancel safe. Fails once the pool has been closed.
    pub async fn acquire(&self) -> Result<SendPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MailflowError::new(ErrorCode::ShutdownInProgress, "send pool is closed"))?;
        Ok(self.admit(permit))
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> Option<SendPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admit(permit))
    }

    /// Refuse all further admissions. Outstanding permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> SendPermit {
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        let current = self.stats.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.peak.fetch_max(current, Ordering::Relaxed);
        PipelineMetrics::set_in_flight(current);
        SendPermit {
            _permit: permit,
            stats: self.stats.clone(),
            finished: false,
        }
    }

    pub fn stats(&self) -> SendPoolStats {
        SendPoolStats {
            max_concurrent: self.max_concurrent,
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            abandoned: self.stats.abandoned.load(Ordering::Relaxed),
            in_flight: self.stats.current.load(Ordering::Relaxed),
            peak_in_flight: self.stats.peak.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPoolStats {
    pub max_concurrent: usize,
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Permits dropped without an outcome (aborted at drain timeout)
    pub abandoned: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl SendPoolStats {
    pub fn success_rate(&self) -> f64 {
        let completed = self.succeeded + self.failed;
        if completed == 0 {
            return 0.0;
        }
        self.succeeded as f64 / completed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = SendPool::new(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.in_flight(), 2);
        assert!(pool.try_acquire().is_none());

        a.mark_success();
        assert_eq!(pool.in_flight(), 1);
        assert!(pool.try_acquire().is_some());

        b.mark_failure();
        let stats = pool.stats();
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.peak_in_flight, 2);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_new_admissions() {
        let pool = SendPool::new(1);
        let held = pool.acquire().await.unwrap();
        pool.close();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShutdownInProgress);
        held.mark_success();
        assert_eq!(pool.stats().succeeded, 1);
    }

    #[test]
    fn test_success_rate() {
        let stats = SendPoolStats {
            max_concurrent: 4,
            admitted: 4,
            succeeded: 3,
            failed: 1,
            abandoned: 0,
            in_flight: 0,
            peak_in_flight: 2,
        };
        assert!((stats.success_rate() - 0.75).abs() < f64::EPSILON);
    }
}
