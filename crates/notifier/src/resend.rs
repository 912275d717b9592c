//! [Resend](https://resend.com) email API client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::sender::{MailSender, OutboundEmail, SendError};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Upper bound for one API call; stays well under the queue visibility timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl ResendMailer {
    pub const DEFAULT_FROM: &'static str = "Courier <notifications@courier.dev>";

    pub fn new(api_key: String, from: String) -> Result<Self, SendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key,
            from,
            endpoint: RESEND_API_URL.to_string(),
        })
    }

    /// Send to `endpoint` instead of the public API.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl MailSender for ResendMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<String, SendError> {
        if email.to.is_empty() {
            return Err(SendError::Invalid("empty recipient".to_string()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &email.idempotency_key)
            .json(&serde_json::json!({
                "from": self.from,
                "to": [email.to],
                "subject": email.subject,
                "text": email.text,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let sent: SendResponse = response.json().await?;
        tracing::debug!(to = %email.to, message_id = %sent.id, "Email accepted by Resend");
        Ok(sent.id)
    }
}
