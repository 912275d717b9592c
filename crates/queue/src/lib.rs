//! Durable message queues with redrive.
//!
//! Stages of the pipeline talk to each other only through these queues. The
//! retry contract normally owned by managed queue infrastructure lives here:
//! - received messages stay invisible for a visibility timeout, then reappear
//! - every receive increments the message's receive count
//! - a message that would exceed `max_receive_count` moves to the dead-letter
//!   queue, wrapped in a [`DeadLetter`](courier_common::types::DeadLetter)

mod consumer;
mod memory;
mod redis_queue;
mod replay;
mod topic;

pub use consumer::{BatchHandler, ProcessingResult, QueueConsumer};
pub use memory::InMemoryQueue;
pub use redis_queue::RedisQueue;
pub use replay::{ReplaySummary, replay_dead_letters};
pub use topic::Topic;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use courier_common::config::AppConfig;
use courier_common::error::AppError;

/// Errors raised by queue backends.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue '{0}' is unavailable")]
    Unavailable(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        AppError::Queue(err.to_string())
    }
}

/// A message handed to a consumer.
///
/// The consumer must `ack` it once processed; otherwise it is redelivered
/// after the visibility timeout. The receipt handle names one receive: once
/// the message is received again, acks and nacks through an older handle
/// are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// Number of times this message has been received, including this one
    pub receive_count: u32,
}

/// Visible and in-flight message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.visible + self.in_flight
    }
}

/// Dead-letter routing for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_queue: String,
    /// Receives allowed before the message is moved to the dead-letter queue
    pub max_receive_count: u32,
}

/// Static configuration of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub visibility_timeout: Duration,
    pub redrive: Option<RedrivePolicy>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Duration::from_secs(30),
            redrive: None,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_redrive(mut self, dead_letter_queue: impl Into<String>, max_receive_count: u32) -> Self {
        self.redrive = Some(RedrivePolicy {
            dead_letter_queue: dead_letter_queue.into(),
            max_receive_count,
        });
        self
    }

    /// Configuration of a pipeline queue: visibility timeout and receive
    /// budget from `config`, dead letters to `<name>-dlq`.
    pub fn pipeline(name: &str, config: &AppConfig) -> Self {
        Self::new(name)
            .with_visibility_timeout(config.visibility_timeout())
            .with_redrive(
                AppConfig::dead_letter_queue_name(name),
                config.queue_max_receive_count,
            )
    }

    /// Configuration of a terminal queue (dead-letter queues): no redrive.
    pub fn terminal(name: &str, config: &AppConfig) -> Self {
        Self::new(name).with_visibility_timeout(config.visibility_timeout())
    }
}

/// Queue port shared by every stage.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Append a message; returns its id.
    async fn send(&self, body: String) -> Result<String, QueueError>;

    /// Receive up to `max_messages` visible messages, hiding them for the
    /// visibility timeout. Messages over their receive budget are dead-lettered
    /// instead of returned.
    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Visibility timeout applied to received messages.
    fn visibility_timeout(&self) -> Duration;

    /// Delete a received message. Unknown or superseded receipts are ignored.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Record a processing failure. The message stays hidden until its
    /// visibility timeout lapses and is then redelivered.
    async fn nack(&self, receipt_handle: &str, error: &str) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

/// Receipt handle of the `receive_count`-th receive of a message.
pub(crate) fn receipt_handle(message_id: &str, receive_count: u32) -> String {
    format!("{}:{}", message_id, receive_count)
}

/// Split a receipt handle into message id and receive count.
pub(crate) fn parse_receipt(receipt_handle: &str) -> Option<(&str, u32)> {
    let (message_id, count) = receipt_handle.rsplit_once(':')?;
    Some((message_id, count.parse().ok()?))
}

/// Serialize `value` as JSON and send it.
pub async fn send_json<T: Serialize + Sync>(
    queue: &dyn MessageQueue,
    value: &T,
) -> Result<String, QueueError> {
    let body = serde_json::to_string(value)?;
    queue.send(body).await
}
