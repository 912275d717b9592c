//! Per-shard change-stream consumer with bisecting retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use courier_common::config::AppConfig;
use courier_common::types::{ChangeEventType, DeadLetter, StreamEntry};
use courier_ingest::record_store::ChangeStream;
use courier_queue::{MessageQueue, send_json};

use crate::builder::NotificationBuilder;
use crate::{FanoutError, STREAM_SOURCE};

const TRIM_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Checkpoint owner name
    pub consumer_name: String,
    pub shard: i32,
    pub batch_size: usize,
    /// Enqueue attempts per entry before it is dead-lettered
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub poll_interval: Duration,
    /// Stream entries older than this are trimmed (shard 0 only)
    pub retention: Duration,
}

impl FanoutConfig {
    pub const CONSUMER_NAME: &'static str = "notification-fanout";

    pub fn from_app_config(config: &AppConfig, shard: i32) -> Self {
        Self {
            consumer_name: Self::CONSUMER_NAME.to_string(),
            shard,
            batch_size: config.fanout_batch_size,
            max_attempts: config.fanout_max_attempts,
            retry_base: Duration::from_millis(config.fanout_retry_base_ms),
            retry_max: Duration::from_secs(5),
            poll_interval: config.poll_interval(),
            retention: Duration::from_secs(config.stream_retention_hours * 3600),
        }
    }

    /// Delay before retrying an entry that has failed `attempts` times.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }
}

/// Per-batch tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub enqueued: usize,
    /// Non-INSERT entries
    pub skipped: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Default)]
struct Failure {
    attempts: u32,
    last_error: String,
}

pub struct FanoutConsumer {
    stream: Arc<dyn ChangeStream>,
    work_queue: Arc<dyn MessageQueue>,
    dead_letters: Arc<dyn MessageQueue>,
    builder: NotificationBuilder,
    config: FanoutConfig,
}

impl FanoutConsumer {
    pub fn new(
        stream: Arc<dyn ChangeStream>,
        work_queue: Arc<dyn MessageQueue>,
        dead_letters: Arc<dyn MessageQueue>,
        builder: NotificationBuilder,
        config: FanoutConfig,
    ) -> Self {
        Self {
            stream,
            work_queue,
            dead_letters,
            builder,
            config,
        }
    }

    /// Poll the shard until the task is cancelled.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            consumer = %self.config.consumer_name,
            shard = self.config.shard,
            batch_size = self.config.batch_size,
            "Fanout consumer started"
        );

        let mut last_trim: Option<Instant> = None;

        loop {
            if self.config.shard == 0 && last_trim.is_none_or(|t| t.elapsed() >= TRIM_INTERVAL) {
                if let Err(e) = self.trim_expired().await {
                    tracing::warn!(error = %e, "Failed to trim change stream");
                }
                last_trim = Some(Instant::now());
            }

            match self.poll_once().await {
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    tracing::error!(
                        shard = self.config.shard,
                        error = %e,
                        "Fanout batch failed, will re-read from checkpoint"
                    );
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Read the next batch after the checkpoint, fan it out, and advance the
    /// checkpoint. Returns `None` when the shard has nothing new.
    pub async fn poll_once(&self) -> Result<Option<BatchOutcome>, FanoutError> {
        let position = self
            .stream
            .checkpoint(&self.config.consumer_name, self.config.shard)
            .await?;
        let entries = self
            .stream
            .read(self.config.shard, position, self.config.batch_size)
            .await?;

        let Some(last) = entries.last() else {
            return Ok(None);
        };
        let last_seq = last.seq;

        let outcome = self.process_batch(&entries).await?;

        self.stream
            .commit(&self.config.consumer_name, self.config.shard, last_seq)
            .await?;

        tracing::info!(
            shard = self.config.shard,
            last_seq,
            enqueued = outcome.enqueued,
            skipped = outcome.skipped,
            dead_lettered = outcome.dead_lettered,
            "Fanout batch processed"
        );

        Ok(Some(outcome))
    }

    /// Enqueue one notification per INSERT entry.
    ///
    /// Entries are enqueued in order. When an enqueue fails the range is
    /// split in half and the halves are retried left first, skipping entries
    /// already enqueued. Every failure counts against the failing entry's
    /// attempt budget; an entry that spends it is dead-lettered on its own.
    pub async fn process_batch(&self, entries: &[StreamEntry]) -> Result<BatchOutcome, FanoutError> {
        let mut outcome = BatchOutcome::default();
        let mut bodies: Vec<Option<String>> = Vec::with_capacity(entries.len());

        for entry in entries {
            if entry.event_type != ChangeEventType::Insert {
                outcome.skipped += 1;
                bodies.push(None);
                continue;
            }

            let message = match &entry.new_image {
                Some(record) => self.builder.build(record).map_err(|e| e.to_string()),
                None => Err("INSERT entry carries no record image".to_string()),
            };
            match message {
                Ok(message) => bodies.push(Some(serde_json::to_string(&message)?)),
                Err(reason) => {
                    tracing::warn!(
                        seq = entry.seq,
                        partition_key = %entry.partition_key,
                        reason = %reason,
                        "Record cannot become a notification"
                    );
                    self.dead_letter(entry, 1, reason).await?;
                    outcome.dead_lettered += 1;
                    bodies.push(None);
                }
            }
        }

        let mut failures: HashMap<usize, Failure> = HashMap::new();
        let mut ranges = vec![(0, entries.len())];

        while let Some((start, end)) = ranges.pop() {
            let mut failed = None;
            for (i, body) in bodies.iter_mut().enumerate().take(end).skip(start) {
                let Some(message) = body.as_ref() else {
                    continue;
                };
                match self.work_queue.send(message.clone()).await {
                    Ok(_) => {
                        *body = None;
                        outcome.enqueued += 1;
                    }
                    Err(e) => {
                        failed = Some((i, e.to_string()));
                        break;
                    }
                }
            }

            let Some((index, error)) = failed else {
                continue;
            };

            let failure = failures.entry(index).or_default();
            failure.attempts += 1;
            failure.last_error = error;

            let entry = &entries[index];
            tracing::debug!(
                seq = entry.seq,
                attempts = failure.attempts,
                error = %failure.last_error,
                "Enqueue failed"
            );

            if failure.attempts >= self.config.max_attempts {
                let attempts = failure.attempts;
                let last_error = failure.last_error.clone();
                tracing::warn!(
                    seq = entry.seq,
                    partition_key = %entry.partition_key,
                    attempts,
                    error = %last_error,
                    "Retry budget exhausted, dead-lettering stream entry"
                );
                self.dead_letter(entry, attempts, last_error).await?;
                outcome.dead_lettered += 1;
                bodies[index] = None;
                ranges.push((index + 1, end));
                continue;
            }

            let delay = self.config.backoff(failure.attempts);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            // Everything before `index` in this range is already enqueued.
            let len = end - index;
            if len > 1 {
                let mid = index + len / 2;
                ranges.push((mid, end));
                ranges.push((index, mid));
            } else {
                ranges.push((index, end));
            }
        }

        Ok(outcome)
    }

    /// Remove stream entries older than the retention window.
    pub async fn trim_expired(&self) -> Result<u64, FanoutError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        Ok(self.stream.trim_before(cutoff).await?)
    }

    async fn dead_letter(&self, entry: &StreamEntry, attempts: u32, last_error: String) -> Result<(), FanoutError> {
        let letter = DeadLetter {
            source: STREAM_SOURCE.to_string(),
            body: serde_json::to_string(entry)?,
            attempts,
            last_error: Some(last_error),
            failed_at: Utc::now(),
        };
        send_json(self.dead_letters.as_ref(), &letter)
            .await
            .map_err(FanoutError::DeadLetter)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use courier_common::types::{NotificationMessage, Record};
    use courier_ingest::memory::InMemoryRecordStore;
    use courier_ingest::record_store::RecordStore;
    use courier_queue::{InMemoryQueue, QueueDepth, QueueError, ReceivedMessage};

    use super::*;

    /// Work queue that rejects messages for one recipient and counts every send.
    struct FlakyQueue {
        inner: InMemoryQueue,
        failing_recipient: String,
        sends: Mutex<HashMap<String, u32>>,
    }

    impl FlakyQueue {
        fn new(failing_recipient: &str) -> Self {
            Self {
                inner: InMemoryQueue::new("notifications", Duration::from_secs(30)),
                failing_recipient: failing_recipient.to_string(),
                sends: Mutex::new(HashMap::new()),
            }
        }

        async fn sends_for(&self, recipient: &str) -> u32 {
            self.sends.lock().await.get(recipient).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl MessageQueue for FlakyQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn visibility_timeout(&self) -> Duration {
            self.inner.visibility_timeout()
        }

        async fn send(&self, body: String) -> Result<String, QueueError> {
            let message: NotificationMessage = serde_json::from_str(&body)?;
            *self.sends.lock().await.entry(message.recipient.clone()).or_default() += 1;
            if message.recipient == self.failing_recipient {
                return Err(QueueError::Unavailable("notifications".to_string()));
            }
            self.inner.send(body).await
        }

        async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
            self.inner.receive(max_messages).await
        }

        async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
            self.inner.ack(receipt_handle).await
        }

        async fn nack(&self, receipt_handle: &str, error: &str) -> Result<(), QueueError> {
            self.inner.nack(receipt_handle, error).await
        }

        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            self.inner.depth().await
        }
    }

    /// Dead-letter queue that is always down.
    struct BrokenQueue;

    #[async_trait]
    impl MessageQueue for BrokenQueue {
        fn name(&self) -> &str {
            "fanout-dlq"
        }

        fn visibility_timeout(&self) -> Duration {
            Duration::ZERO
        }

        async fn send(&self, _body: String) -> Result<String, QueueError> {
            Err(QueueError::Unavailable("fanout-dlq".to_string()))
        }

        async fn receive(&self, _max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
            Ok(Vec::new())
        }

        async fn ack(&self, _receipt_handle: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn nack(&self, _receipt_handle: &str, _error: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            Ok(QueueDepth::default())
        }
    }

    fn test_config() -> FanoutConfig {
        FanoutConfig {
            consumer_name: "test-fanout".to_string(),
            shard: 0,
            batch_size: 5,
            max_attempts: 10,
            retry_base: Duration::ZERO,
            retry_max: Duration::ZERO,
            poll_interval: Duration::ZERO,
            retention: Duration::from_secs(3600),
        }
    }

    fn record(email: &str) -> Record {
        Record {
            id: Uuid::new_v4(),
            batch_key: "uploads/batch.csv".to_string(),
            line_number: 2,
            payload: json!({ "email": email }),
            created_at: Utc::now(),
        }
    }

    async fn seeded_stream(emails: &[&str]) -> Arc<InMemoryRecordStore> {
        let store = Arc::new(InMemoryRecordStore::new(1));
        let records: Vec<Record> = emails.iter().map(|e| record(e)).collect();
        store
            .write_batch(
                &courier_common::types::ObjectCreatedEvent {
                    bucket: "uploads".to_string(),
                    key: "uploads/batch.csv".to_string(),
                },
                &records,
                0,
            )
            .await
            .unwrap();
        store
    }

    fn consumer(
        stream: Arc<InMemoryRecordStore>,
        work_queue: Arc<dyn MessageQueue>,
        dead_letters: Arc<dyn MessageQueue>,
        config: FanoutConfig,
    ) -> FanoutConsumer {
        FanoutConsumer::new(
            stream,
            work_queue,
            dead_letters,
            NotificationBuilder::new("email"),
            config,
        )
    }

    #[tokio::test]
    async fn test_one_message_per_insert() {
        let stream = seeded_stream(&["a@example.com", "b@example.com", "c@example.com"]).await;
        let work = Arc::new(InMemoryQueue::new("notifications", Duration::from_secs(30)));
        let dlq = Arc::new(InMemoryQueue::new("fanout-dlq", Duration::ZERO));
        let fanout = consumer(stream.clone(), work.clone(), dlq.clone(), test_config());

        let outcome = fanout.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome.enqueued, 3);
        assert_eq!(work.depth().await.unwrap().visible, 3);
        assert_eq!(dlq.depth().await.unwrap().total(), 0);

        assert_eq!(stream.checkpoint("test-fanout", 0).await.unwrap(), 3);
        assert!(fanout.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bisection_isolates_failing_entry() {
        let stream = seeded_stream(&[
            "a@example.com",
            "b@example.com",
            "fail@example.com",
            "d@example.com",
            "e@example.com",
        ])
        .await;
        let work = Arc::new(FlakyQueue::new("fail@example.com"));
        let dlq = Arc::new(InMemoryQueue::new("fanout-dlq", Duration::ZERO));
        let fanout = consumer(stream.clone(), work.clone(), dlq.clone(), test_config());

        let outcome = fanout.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome.enqueued, 4);
        assert_eq!(outcome.dead_lettered, 1);

        for email in ["a@example.com", "b@example.com", "d@example.com", "e@example.com"] {
            assert_eq!(work.sends_for(email).await, 1, "{} enqueued more than once", email);
        }
        assert_eq!(work.sends_for("fail@example.com").await, 10);

        let letters = dlq.bodies().await;
        assert_eq!(letters.len(), 1);
        let letter: DeadLetter = serde_json::from_str(&letters[0]).unwrap();
        assert_eq!(letter.source, STREAM_SOURCE);
        assert_eq!(letter.attempts, 10);
        assert!(letter.last_error.unwrap().contains("unavailable"));

        let entry: StreamEntry = serde_json::from_str(&letter.body).unwrap();
        assert_eq!(entry.seq, 3);
        assert_eq!(entry.new_image.unwrap().payload["email"], "fail@example.com");

        assert_eq!(stream.checkpoint("test-fanout", 0).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_partition_order_preserved_around_failure() {
        let stream = seeded_stream(&["a@example.com", "fail@example.com", "c@example.com"]).await;
        let work = Arc::new(FlakyQueue::new("fail@example.com"));
        let dlq = Arc::new(InMemoryQueue::new("fanout-dlq", Duration::ZERO));
        let mut config = test_config();
        config.max_attempts = 3;
        let fanout = consumer(stream, work.clone(), dlq, config);

        fanout.poll_once().await.unwrap();

        let mut received = Vec::new();
        for message in work.receive(10).await.unwrap() {
            let message: NotificationMessage = serde_json::from_str(&message.body).unwrap();
            received.push(message.recipient);
        }
        assert_eq!(received, vec!["a@example.com", "c@example.com"]);
    }

    #[tokio::test]
    async fn test_non_insert_entries_are_skipped() {
        let stream = seeded_stream(&["a@example.com"]).await;
        let image = record("b@example.com");
        stream
            .append_change(ChangeEventType::Modify, &image.id.to_string(), Some(image.clone()))
            .await;
        stream
            .append_change(ChangeEventType::Remove, &image.id.to_string(), None)
            .await;

        let work = Arc::new(InMemoryQueue::new("notifications", Duration::from_secs(30)));
        let dlq = Arc::new(InMemoryQueue::new("fanout-dlq", Duration::ZERO));
        let fanout = consumer(stream, work.clone(), dlq, test_config());

        let outcome = fanout.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(work.depth().await.unwrap().visible, 1);
    }

    #[tokio::test]
    async fn test_unconvertible_record_dead_lettered_immediately() {
        let stream = seeded_stream(&["a@example.com", "no-address"]).await;
        let work = Arc::new(InMemoryQueue::new("notifications", Duration::from_secs(30)));
        let dlq = Arc::new(InMemoryQueue::new("fanout-dlq", Duration::ZERO));
        let fanout = consumer(stream, work.clone(), dlq.clone(), test_config());

        let outcome = fanout.poll_once().await.unwrap().unwrap();
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(outcome.dead_lettered, 1);

        let letter: DeadLetter = serde_json::from_str(&dlq.bodies().await[0]).unwrap();
        assert_eq!(letter.attempts, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_failure_keeps_checkpoint() {
        let stream = seeded_stream(&["fail@example.com"]).await;
        let work = Arc::new(FlakyQueue::new("fail@example.com"));
        let mut config = test_config();
        config.max_attempts = 2;
        let fanout = consumer(stream.clone(), work, Arc::new(BrokenQueue), config);

        let result = fanout.poll_once().await;
        assert!(matches!(result, Err(FanoutError::DeadLetter(_))));
        assert_eq!(stream.checkpoint("test-fanout", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reprocessing_a_batch_is_harmless() {
        let stream = seeded_stream(&["a@example.com"]).await;
        let work = Arc::new(InMemoryQueue::new("notifications", Duration::from_secs(30)));
        let dlq = Arc::new(InMemoryQueue::new("fanout-dlq", Duration::ZERO));
        let fanout = consumer(stream.clone(), work.clone(), dlq, test_config());

        let entries = stream.read(0, 0, 10).await.unwrap();
        fanout.process_batch(&entries).await.unwrap();
        fanout.process_batch(&entries).await.unwrap();

        // At-least-once: the duplicate carries the same record id.
        let bodies = work.bodies().await;
        assert_eq!(bodies.len(), 2);
        let first: NotificationMessage = serde_json::from_str(&bodies[0]).unwrap();
        let second: NotificationMessage = serde_json::from_str(&bodies[1]).unwrap();
        assert_eq!(first.record_id, second.record_id);
    }

    #[tokio::test]
    async fn test_starts_from_trim_horizon_and_batches() {
        let emails: Vec<String> = (0..7).map(|i| format!("user{}@example.com", i)).collect();
        let refs: Vec<&str> = emails.iter().map(String::as_str).collect();
        let stream = seeded_stream(&refs).await;
        let work = Arc::new(InMemoryQueue::new("notifications", Duration::from_secs(30)));
        let dlq = Arc::new(InMemoryQueue::new("fanout-dlq", Duration::ZERO));
        let fanout = consumer(stream.clone(), work.clone(), dlq, test_config());

        assert_eq!(fanout.poll_once().await.unwrap().unwrap().enqueued, 5);
        assert_eq!(fanout.poll_once().await.unwrap().unwrap().enqueued, 2);
        assert!(fanout.poll_once().await.unwrap().is_none());
        assert_eq!(stream.checkpoint("test-fanout", 0).await.unwrap(), 7);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = FanoutConfig {
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(5),
            ..test_config()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(1600));
        assert_eq!(config.backoff(10), Duration::from_secs(5));
    }
}
