//! Amazon SES v2 delivery gateway.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sesv2::config::Credentials;
use aws_sdk_sesv2::error::{DisplayErrorContext, SdkError};
use aws_sdk_sesv2::operation::send_email::SendEmailError;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message, MessageHeader};
use aws_sdk_sesv2::Client;
use tracing::info;

use super::{validate, DeliveryGateway, GatewayError, OutboundEmail};
use crate::config::GatewayConfig;
use crate::error::{MailflowError, Result};

const CHARSET: &str = "UTF-8";
const CORRELATION_HEADER: &str = "X-Request-ID";

/// Sends through the SES v2 `SendEmail` API as a simple HTML message.
#[derive(Debug, Clone)]
pub struct SesGateway {
    client: Client,
    sender: String,
    configuration_set: Option<String>,
}

impl SesGateway {
    /// Build a client from configuration.
    ///
    /// A missing sender address is a startup error. Static credentials are used
    /// only when both halves are present, otherwise the default AWS chain.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let sender = config
            .sender
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                MailflowError::invalid_config("gateway.sender", "a sender address is required")
            })?
            .to_string();

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "mailflow-static",
            ));
        }
        let sdk_config = loader.load().await;

        info!(region = %config.region, sender = %sender, "SES gateway initialized");

        Ok(Self {
            client: Client::new(&sdk_config),
            sender,
            configuration_set: config.configuration_set.clone().filter(|s| !s.is_empty()),
        })
    }

    fn build_content(email: &OutboundEmail) -> std::result::Result<EmailContent, GatewayError> {
        let subject = Content::builder()
            .data(&email.subject)
            .charset(CHARSET)
            .build()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        let html = Content::builder()
            .data(&email.html_body)
            .charset(CHARSET)
            .build()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        let header = MessageHeader::builder()
            .name(CORRELATION_HEADER)
            .value(email.correlation_id.to_string())
            .build()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        let message = Message::builder()
            .subject(subject)
            .body(Body::builder().html(html).build())
            .headers(header)
            .build();

        Ok(EmailContent::builder().simple(message).build())
    }
}

fn classify(err: SdkError<SendEmailError>) -> GatewayError {
    let text = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ServiceError(service) => {
            let inner = service.err();
            if inner.is_too_many_requests_exception() || inner.is_limit_exceeded_exception() {
                GatewayError::Transport(text)
            } else {
                GatewayError::Rejected(text)
            }
        }
        SdkError::ConstructionFailure(_) => GatewayError::Validation(text),
        _ => GatewayError::Transport(text),
    }
}

#[async_trait]
impl DeliveryGateway for SesGateway {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, GatewayError> {
        validate(email)?;

        let destination = Destination::builder()
            .set_to_addresses(Some(email.recipients.clone()))
            .build();

        let output = self
            .client
            .send_email()
            .from_email_address(&self.sender)
            .destination(destination)
            .content(Self::build_content(email)?)
            .set_configuration_set_name(self.configuration_set.clone())
            .send()
            .await
            .map_err(classify)?;

        match output.message_id() {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(GatewayError::Transport(
                "SES returned no message id".to_string(),
            )),
        }
    }
}
