//! Notification work queue → delivery channel.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use courier_common::types::{DeliveryRecord, DeliveryStatus, NotificationMessage};
use courier_queue::{BatchHandler, ProcessingResult, ReceivedMessage};

use crate::render::render_email;
use crate::sender::MailSender;
use crate::store::DeliveryStore;

pub struct Dispatcher {
    sender: Arc<dyn MailSender>,
    deliveries: Arc<dyn DeliveryStore>,
}

impl Dispatcher {
    pub fn new(sender: Arc<dyn MailSender>, deliveries: Arc<dyn DeliveryStore>) -> Self {
        Self { sender, deliveries }
    }

    /// Send one notification and record it as SENT.
    ///
    /// A record that already has a delivery record is not sent again.
    pub async fn dispatch(&self, message: &NotificationMessage) -> anyhow::Result<Option<String>> {
        if let Some(existing) = self.deliveries.find_by_record_id(message.record_id).await? {
            tracing::info!(
                record_id = %message.record_id,
                message_id = %existing.message_id,
                "Record already dispatched, skipping duplicate"
            );
            return Ok(None);
        }

        let email = render_email(message);
        let message_id = self.sender.send(&email).await?;

        let now = Utc::now();
        let record = DeliveryRecord {
            message_id: message_id.clone(),
            record_id: message.record_id,
            recipient: message.recipient.clone(),
            sent_at: now,
            status: DeliveryStatus::Sent,
            status_updated_at: now,
        };

        if !self.deliveries.insert(&record).await? {
            tracing::warn!(
                record_id = %message.record_id,
                message_id = %message_id,
                "Delivery record already exists"
            );
        }

        tracing::info!(
            record_id = %message.record_id,
            recipient = %message.recipient,
            message_id = %message_id,
            "Notification sent"
        );

        Ok(Some(message_id))
    }
}

#[async_trait]
impl BatchHandler for Dispatcher {
    async fn handle_batch(&self, messages: &[ReceivedMessage]) -> ProcessingResult {
        let mut result = ProcessingResult::default();

        for (i, received) in messages.iter().enumerate() {
            let message: NotificationMessage = match serde_json::from_str(&received.body) {
                Ok(message) => message,
                Err(e) => {
                    result.nack.push((i, format!("invalid notification message: {}", e)));
                    continue;
                }
            };

            match self.dispatch(&message).await {
                Ok(_) => result.ack.push(i),
                Err(e) => {
                    tracing::error!(
                        record_id = %message.record_id,
                        receive_count = received.receive_count,
                        error = %e,
                        "Failed to dispatch notification"
                    );
                    result.nack.push((i, e.to_string()));
                }
            }
        }

        result
    }
}
