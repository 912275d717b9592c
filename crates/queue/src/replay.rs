//! Manual replay of dead letters back onto their source queue.

use serde::Serialize;

use courier_common::types::DeadLetter;

use crate::{MessageQueue, QueueError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub replayed: usize,
    /// Dead-letter messages that could not be decoded; left in the queue
    pub skipped: usize,
}

/// Move up to `limit` dead letters from `dead_letters` to `target`, sending
/// each original body verbatim.
pub async fn replay_dead_letters(
    dead_letters: &dyn MessageQueue,
    target: &dyn MessageQueue,
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
            match serde_json::from_str::<DeadLetter>(&message.body) {
                Ok(letter) => {
                    target.send(letter.body).await?;
                    dead_letters.ack(&message.receipt_handle).await?;
                    summary.replayed += 1;
                }
                Err(e) => {
                    dead_letters
                        .nack(&message.receipt_handle, &format!("undecodable dead letter: {}", e))
                        .await?;
                    summary.skipped += 1;
                }
            }
        }
    }

    tracing::info!(
        dead_letter_queue = %dead_letters.name(),
        target = %target.name(),
        replayed = summary.replayed,
        skipped = summary.skipped,
        "Dead letters replayed"
    );

    Ok(summary)
}
