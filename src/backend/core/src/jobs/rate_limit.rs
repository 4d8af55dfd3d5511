//! Token bucket gating gateway calls.
//!
//! Capacity and refill rate are both the configured sends per second, so a
//! full bucket allows one second's worth of burst and sustained load settles
//! at the configured rate.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Float slack so refill rounding never strands a whole token.
const EPSILON: f64 = 1e-9;

/// Shortest sleep between refill checks; keeps paused-clock tests advancing.
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Async token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64,
}

impl TokenBucket {
    /// Bucket whose capacity and refill rate both equal `per_second`.
    pub fn per_second(per_second: u32) -> Self {
        Self::new(per_second, per_second)
    }

    /// Starts full.
    pub fn new(capacity: u32, refill_per_second: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
            capacity: f64::from(capacity),
            refill_rate: f64::from(refill_per_second),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_take().is_ok()
    }

    /// Wait until a token is available, then take it.
    ///
    /// Cancel safe: a dropped future has not consumed a token.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait.max(MIN_WAIT)).await,
            }
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        (state.tokens + EPSILON) as u64
    }

    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens + EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            Ok(())
        } else if self.refill_rate <= 0.0 {
            Err(Duration::from_secs(1))
        } else {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate))
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}
