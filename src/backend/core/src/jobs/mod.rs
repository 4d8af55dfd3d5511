//! Claim-and-dispatch pipeline.
//!
//! ```text
//! ┌────────────┐  claim_batch   ┌────────────┐  push   ┌─────────────┐
//! │  JobStore  │ ─────────────▶ │ Scheduler  │ ──────▶ │ HandoffQueue│
//! └────────────┘                └────────────┘         └──────┬──────┘
//!       ▲                                                     │ recv
//!       │ update_terminal                                     ▼
//!       │                 ┌─────────┐   ┌──────────┐   ┌────────────┐
//!       └──────────────── │ Gateway │ ◀ │ SendPool │ ◀ │ TokenBucket│
//!                         └─────────┘   └──────────┘   └────────────┘
//!                                 Dispatcher (worker)
//! ```
//!
//! - **job**: data model and the status state machine
//! - **scheduler**: periodic, quota-bounded claims
//! - **queue**: bounded hand-off providing backpressure
//! - **rate_limit**: token bucket for the send rate
//! - **pool**: concurrency slots for gateway calls
//! - **worker**: the dispatcher and its send units

pub mod job;
pub mod pool;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;
pub mod worker;

pub use job::{
    ClaimedJob, Content, ContentId, DeliveryEvent, EnqueueReceipt, EventKind, JobId, JobStatus,
    MailJob, NewMessage, StatusCounts,
};
pub use pool::{SendPermit, SendPool, SendPoolStats};
pub use queue::{HandoffQueue, HandoffReceiver, HandoffSender, PushError};
pub use rate_limit::TokenBucket;
pub use scheduler::{Scheduler, SchedulerSummary, TickReport};
pub use worker::{
    with_tracking_pixel, DispatchSummary, Dispatcher, SendOutcome, ThroughputWindow,
    WindowSnapshot,
};
