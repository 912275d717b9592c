use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use courier_common::config::AppConfig;

use crate::resend::ResendMailer;

/// Fully rendered email ready for the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    /// Same key for every attempt of the same record, so a retried send is
    /// collapsed by the channel
    pub idempotency_key: String,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Delivery channel rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Outbound delivery channel. Returns the channel's message id.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<String, SendError>;
}

/// Logs instead of sending. Used when no API key is configured.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl MailSender for LogMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<String, SendError> {
        let message_id = format!("local-{}", Uuid::new_v4());
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            message_id = %message_id,
            "Email delivery not configured, logging message instead"
        );
        Ok(message_id)
    }
}

/// Resend when `RESEND_API_KEY` is set, otherwise [`LogMailer`].
pub fn mailer_from_config(config: &AppConfig) -> Result<Arc<dyn MailSender>, SendError> {
    match &config.resend_api_key {
        Some(api_key) => {
            let from = config
                .email_from
                .clone()
                .unwrap_or_else(|| ResendMailer::DEFAULT_FROM.to_string());
            Ok(Arc::new(ResendMailer::new(api_key.clone(), from)?))
        }
        None => {
            tracing::warn!("RESEND_API_KEY not set, emails will only be logged");
            Ok(Arc::new(LogMailer))
        }
    }
}
