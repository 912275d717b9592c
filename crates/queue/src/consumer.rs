//! Receive → handle → acknowledge loop shared by the queue-driven stages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{MessageQueue, QueueError, ReceivedMessage};

/// Result of handling a batch of messages.
///
/// Indices refer to positions in the batch handed to the handler. Messages
/// listed in neither vector are left untouched and redelivered after their
/// visibility timeout.
#[derive(Debug, Default, PartialEq)]
pub struct ProcessingResult {
    /// Messages to delete from the queue
    pub ack: Vec<usize>,
    /// Messages that failed, with the error recorded for dead-lettering
    pub nack: Vec<(usize, String)>,
}

/// Stage logic invoked with each received batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, messages: &[ReceivedMessage]) -> ProcessingResult;
}

/// Polls one queue and feeds batches to a handler.
///
/// Each batch must finish within nine tenths of the queue's visibility
/// timeout. A batch that overruns is abandoned without any ack or nack and
/// is redelivered once its messages become visible again. A queue with a
/// zero visibility timeout has no batch deadline.
pub struct QueueConsumer {
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn BatchHandler>,
    batch_size: usize,
    poll_interval: Duration,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        handler: Arc<dyn BatchHandler>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            batch_size,
            poll_interval,
        }
    }

    /// Run until the task is cancelled. Errors are logged and the loop backs off.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            queue = %self.queue.name(),
            batch_size = self.batch_size,
            "Queue consumer started"
        );

        loop {
            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(self.poll_interval).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(queue = %self.queue.name(), error = %e, "Error processing batch");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    fn batch_deadline(&self) -> Option<Duration> {
        let visibility = self.queue.visibility_timeout();
        (!visibility.is_zero()).then(|| visibility - visibility / 10)
    }

    /// Receive and handle one batch. Returns the number of messages received.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let messages = self.queue.receive(self.batch_size).await?;
        if messages.is_empty() {
            return Ok(0);
        }

        tracing::debug!(
            queue = %self.queue.name(),
            count = messages.len(),
            "Received message batch"
        );

        let handled = self.handler.handle_batch(&messages);
        let result = match self.batch_deadline() {
            Some(deadline) => match tokio::time::timeout(deadline, handled).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        queue = %self.queue.name(),
                        count = messages.len(),
                        deadline_ms = deadline.as_millis() as u64,
                        "Batch exceeded its deadline, leaving messages for redelivery"
                    );
                    return Ok(messages.len());
                }
            },
            None => handled.await,
        };

        for index in &result.ack {
            if let Some(message) = messages.get(*index) {
                self.queue.ack(&message.receipt_handle).await?;
            }
        }

        for (index, error) in &result.nack {
            if let Some(message) = messages.get(*index) {
                tracing::warn!(
                    queue = %self.queue.name(),
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %error,
                    "Message processing failed, leaving for redelivery"
                );
                self.queue.nack(&message.receipt_handle, error).await?;
            }
        }

        Ok(messages.len())
    }
}
