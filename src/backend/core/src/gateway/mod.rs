//! Delivery gateway boundary.
//!
//! The dispatcher only knows [`DeliveryGateway::send`]. Transport details live
//! in the implementations ([`ses::SesGateway`] in production, scripted fakes in
//! tests).

pub mod ses;

pub use ses::SesGateway;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::jobs::job::JobId;

/// A fully rendered message for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    /// Job id, forwarded to the provider for correlation
    pub correlation_id: JobId,
    pub subject: String,
    pub html_body: String,
    pub recipients: Vec<String>,
}

/// Errors returned by a delivery gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The message was malformed; sending it again will not help.
    #[error("validation error: {0}")]
    Validation(String),

    /// The provider refused the message.
    #[error("rejected by provider: {0}")]
    Rejected(String),

    /// Network or service failure talking to the provider.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not finish within the per-send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl GatewayError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::GatewayValidation,
            Self::Rejected(_) => ErrorCode::GatewayRejected,
            Self::Transport(_) => ErrorCode::GatewayUnavailable,
            Self::Timeout(_) => ErrorCode::GatewayTimeout,
        }
    }
}

/// Outbound send capability.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Send one message, returning the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> Result<String, GatewayError>;
}

/// Reject messages no provider would accept.
///
/// Every gateway calls this before doing any I/O.
pub fn validate(email: &OutboundEmail) -> Result<(), GatewayError> {
    if email.subject.trim().is_empty() {
        return Err(GatewayError::Validation("subject cannot be empty".into()));
    }
    if email.html_body.trim().is_empty() {
        return Err(GatewayError::Validation("body cannot be empty".into()));
    }
    if email.recipients.is_empty() {
        return Err(GatewayError::Validation(
            "recipient list cannot be empty".into(),
        ));
    }
    Ok(())
}
