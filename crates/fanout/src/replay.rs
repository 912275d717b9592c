//! Replay of fanout dead letters onto the notification work queue.

use courier_common::types::{DeadLetter, StreamEntry};
use courier_queue::{MessageQueue, QueueError, ReplaySummary, send_json};

use crate::builder::NotificationBuilder;

/// Rebuild notifications from up to `limit` dead-lettered stream entries and
/// enqueue them. Letters that still cannot become a notification are left in
/// the dead-letter queue.
pub async fn replay_fanout_dead_letters(
    dead_letters: &dyn MessageQueue,
    work_queue: &dyn MessageQueue,
    builder: &NotificationBuilder,
    limit: usize,
) -> Result<ReplaySummary, QueueError> {
    let mut summary = ReplaySummary::default();
    let mut seen = 0;

    while seen < limit {
        let batch = dead_letters.receive((limit - seen).min(10)).await?;
        if batch.is_empty() {
            break;
        }
        seen += batch.len();

        for message in batch {
            let rebuilt = serde_json::from_str::<DeadLetter>(&message.body)
                .map_err(|e| format!("undecodable dead letter: {}", e))
                .and_then(|letter| {
                    serde_json::from_str::<StreamEntry>(&letter.body)
                        .map_err(|e| format!("undecodable stream entry: {}", e))
                })
                .and_then(|entry| {
                    entry
                        .new_image
                        .ok_or_else(|| "stream entry has no record image".to_string())
                })
                .and_then(|record| builder.build(&record).map_err(|e| e.to_string()));

            match rebuilt {
                Ok(notification) => {
                    send_json(work_queue, &notification).await?;
                    dead_letters.ack(&message.receipt_handle).await?;
                    summary.replayed += 1;
                }
                Err(reason) => {
                    tracing::warn!(message_id = %message.message_id, reason = %reason, "Skipping dead letter");
                    dead_letters.nack(&message.receipt_handle, &reason).await?;
                    summary.skipped += 1;
                }
            }
        }
    }

    tracing::info!(
        dead_letter_queue = %dead_letters.name(),
        target = %work_queue.name(),
        replayed = summary.replayed,
        skipped = summary.skipped,
        "Fanout dead letters replayed"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use courier_common::types::{ChangeEventType, NotificationMessage, Record};
    use courier_queue::InMemoryQueue;

    use super::*;
    use crate::STREAM_SOURCE;

    fn letter(email: &str) -> String {
        let entry = StreamEntry {
            seq: 9,
            shard: 0,
            partition_key: "k".to_string(),
            event_type: ChangeEventType::Insert,
            new_image: Some(Record {
                id: Uuid::new_v4(),
                batch_key: "uploads/batch.csv".to_string(),
                line_number: 2,
                payload: json!({ "email": email }),
                created_at: Utc::now(),
            }),
            created_at: Utc::now(),
        };
        serde_json::to_string(&DeadLetter {
            source: STREAM_SOURCE.to_string(),
            body: serde_json::to_string(&entry).unwrap(),
            attempts: 10,
            last_error: Some("queue down".to_string()),
            failed_at: Utc::now(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_replay_rebuilds_notifications() {
        let dlq = InMemoryQueue::new("fanout-dlq", Duration::from_secs(30));
        let work = InMemoryQueue::new("notifications", Duration::from_secs(30));
        dlq.send(letter("ada@example.com")).await.unwrap();
        dlq.send(letter("not-an-address")).await.unwrap();

        let builder = NotificationBuilder::new("email");
        let summary = replay_fanout_dead_letters(&dlq, &work, &builder, 10).await.unwrap();

        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.skipped, 1);

        let bodies = work.bodies().await;
        let message: NotificationMessage = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(message.recipient, "ada@example.com");
        assert_eq!(dlq.depth().await.unwrap().total(), 1);
    }
}
