#![allow(clippy::result_large_err)]
//! # Mailflow Core
//!
//! Bulk email claim-and-dispatch pipeline.
//!
//! ## Architecture
//!
//! - **Jobs**: job model, status state machine, scheduler, hand-off queue and dispatcher
//! - **Database**: atomic batch claims and terminal write-back (PostgreSQL or in-memory)
//! - **Gateway**: outbound delivery boundary with an Amazon SES implementation
//! - **Pipeline**: explicit context wiring one scheduler to one dispatcher
//! - **Telemetry**: structured logging with redaction and Prometheus metrics

pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod pipeline;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, MailflowError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, DispatchConfig};
    pub use crate::db::{JobAdmin, JobStore, MemoryJobStore, PgJobStore};
    pub use crate::error::{ErrorCode, ErrorContext, MailflowError, Result};
    pub use crate::gateway::{DeliveryGateway, GatewayError, OutboundEmail, SesGateway};
    pub use crate::jobs::{
        ClaimedJob, Content, ContentId, DispatchSummary, JobId, JobStatus, MailJob, NewMessage,
        StatusCounts,
    };
    pub use crate::pipeline::{Pipeline, PipelineHandle, PipelineSummary};
}
