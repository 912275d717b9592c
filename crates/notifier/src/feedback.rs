//! Delivery-outcome events → delivery record status.

use std::sync::Arc;

use async_trait::async_trait;

use courier_common::types::DeliveryOutcomeEvent;
use courier_queue::{BatchHandler, ProcessingResult, ReceivedMessage};

use crate::store::{DeliveryStore, OutcomeApplied};

pub struct FeedbackSink {
    deliveries: Arc<dyn DeliveryStore>,
}

impl FeedbackSink {
    pub fn new(deliveries: Arc<dyn DeliveryStore>) -> Self {
        Self { deliveries }
    }
}

#[async_trait]
impl BatchHandler for FeedbackSink {
    async fn handle_batch(&self, messages: &[ReceivedMessage]) -> ProcessingResult {
        let mut result = ProcessingResult::default();

        for (i, received) in messages.iter().enumerate() {
            let event: DeliveryOutcomeEvent = match serde_json::from_str(&received.body) {
                Ok(event) => event,
                Err(e) => {
                    result.nack.push((i, format!("invalid outcome event: {}", e)));
                    continue;
                }
            };

            let status = event.outcome_type.status();
            match self
                .deliveries
                .apply_outcome(&event.message_id, status, event.timestamp)
                .await
            {
                Ok(OutcomeApplied::Updated) => {
                    tracing::info!(
                        message_id = %event.message_id,
                        status = %status,
                        "Delivery status updated"
                    );
                    result.ack.push(i);
                }
                Ok(OutcomeApplied::Stale) => {
                    tracing::debug!(
                        message_id = %event.message_id,
                        status = %status,
                        timestamp = %event.timestamp,
                        "Ignoring outcome older than current status"
                    );
                    result.ack.push(i);
                }
                Ok(OutcomeApplied::UnknownMessage) => {
                    tracing::warn!(
                        message_id = %event.message_id,
                        recipient = %event.recipient,
                        "Outcome for unknown message id, dropping"
                    );
                    result.ack.push(i);
                }
                Err(e) => {
                    tracing::error!(message_id = %event.message_id, error = %e, "Failed to apply outcome");
                    result.nack.push((i, e.to_string()));
                }
            }
        }

        result
    }
}
