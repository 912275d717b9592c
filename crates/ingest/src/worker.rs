//! Queue handler feeding object-created events into [`IngestService`].

use std::sync::Arc;

use async_trait::async_trait;

use courier_common::types::ObjectCreatedEvent;
use courier_queue::{BatchHandler, ProcessingResult, ReceivedMessage};

use crate::service::IngestService;

pub struct IngestHandler {
    service: Arc<IngestService>,
}

impl IngestHandler {
    pub fn new(service: Arc<IngestService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl BatchHandler for IngestHandler {
    async fn handle_batch(&self, messages: &[ReceivedMessage]) -> ProcessingResult {
        let mut result = ProcessingResult::default();

        for (i, message) in messages.iter().enumerate() {
            let event: ObjectCreatedEvent = match serde_json::from_str(&message.body) {
                Ok(event) => event,
                Err(e) => {
                    result.nack.push((i, format!("invalid object event: {}", e)));
                    continue;
                }
            };

            match self.service.ingest(&event).await {
                Ok(_) => result.ack.push(i),
                Err(e) => {
                    tracing::error!(
                        bucket = %event.bucket,
                        key = %event.key,
                        error = %e,
                        "Failed to ingest batch object"
                    );
                    result.nack.push((i, e.to_string()));
                }
            }
        }

        result
    }
}
