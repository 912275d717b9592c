//! Change stream → notification work queue.
//!
//! Each shard of the record change stream is read in micro-batches. Every
//! INSERT becomes one notification message on the work queue. A failing
//! enqueue splits the batch in half until the failing entry is isolated;
//! only that entry is retried, and it is dead-lettered once its attempt
//! budget is spent.

pub mod builder;
pub mod consumer;
pub mod replay;

pub use builder::{ConversionError, NotificationBuilder};
pub use consumer::{BatchOutcome, FanoutConfig, FanoutConsumer};
pub use replay::replay_fanout_dead_letters;

use thiserror::Error;

use courier_common::error::AppError;
use courier_queue::QueueError;

/// `source` stamped on dead letters written by the fanout.
pub const STREAM_SOURCE: &str = "record-stream";

/// Stage-wide fanout failures. The batch is not checkpointed and is read
/// again on the next poll.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("Change stream error: {0}")]
    Stream(#[from] AppError),

    #[error("Failed to write dead letter: {0}")]
    DeadLetter(#[source] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
