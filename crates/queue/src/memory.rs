//! In-memory queue with the same redrive semantics as the Redis backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use courier_common::types::DeadLetter;

use crate::{MessageQueue, QueueDepth, QueueError, ReceivedMessage, parse_receipt, receipt_handle};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: String,
    receive_count: u32,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct InMemoryQueueState {
    /// Visible message ids in delivery order.
    ready: VecDeque<String>,
    /// In-flight message id → visibility deadline.
    in_flight: HashMap<String, Instant>,
    messages: HashMap<String, StoredMessage>,
}

impl InMemoryQueueState {
    /// Message id behind `receipt_handle` if it names the latest receive.
    fn current_receipt(&self, receipt_handle: &str) -> Option<String> {
        let (id, count) = parse_receipt(receipt_handle)?;
        let message = self.messages.get(id)?;
        (message.receive_count == count).then(|| id.to_string())
    }

    /// Return in-flight messages whose visibility deadline has passed to the
    /// front of the ready list, oldest deadline first.
    fn release_expired(&mut self, now: Instant) {
        let mut expired: Vec<(String, Instant)> = self
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (id.clone(), *deadline))
            .collect();
        expired.sort_by_key(|(_, deadline)| *deadline);

        for (id, _) in expired.into_iter().rev() {
            self.in_flight.remove(&id);
            self.ready.push_front(id);
        }
    }
}

struct Redrive {
    dead_letters: Arc<InMemoryQueue>,
    max_receive_count: u32,
}

/// Process-local queue used by tests and single-process runs.
pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    redrive: Option<Redrive>,
    state: Mutex<InMemoryQueueState>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            redrive: None,
            state: Mutex::new(InMemoryQueueState::default()),
        }
    }

    /// Route messages received more than `max_receive_count` times to `dead_letters`.
    pub fn with_redrive(mut self, dead_letters: Arc<InMemoryQueue>, max_receive_count: u32) -> Self {
        self.redrive = Some(Redrive {
            dead_letters,
            max_receive_count,
        });
        self
    }

    pub fn dead_letters(&self) -> Option<&Arc<InMemoryQueue>> {
        self.redrive.as_ref().map(|r| &r.dead_letters)
    }

    /// Bodies of every stored message (visible or in flight), in no particular order.
    pub async fn bodies(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.messages.values().map(|m| m.body.clone()).collect()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    async fn send(&self, body: String) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state.messages.insert(
            id.clone(),
            StoredMessage {
                body,
                receive_count: 0,
                last_error: None,
            },
        );
        state.ready.push_back(id.clone());
        Ok(id)
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut received = Vec::new();
        let mut letters = Vec::new();

        {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.release_expired(now);

            while received.len() < max_messages {
                let Some(id) = state.ready.pop_front() else {
                    break;
                };
                // Acked while its expired copy sat in the ready list.
                let Some(message) = state.messages.get_mut(&id) else {
                    continue;
                };

                if let Some(redrive) = &self.redrive
                    && message.receive_count >= redrive.max_receive_count
                {
                    let letter = DeadLetter {
                        source: self.name.clone(),
                        body: message.body.clone(),
                        attempts: message.receive_count,
                        last_error: message.last_error.clone(),
                        failed_at: Utc::now(),
                    };
                    state.messages.remove(&id);
                    letters.push(letter);
                    continue;
                }

                message.receive_count += 1;
                let item = ReceivedMessage {
                    message_id: id.clone(),
                    receipt_handle: receipt_handle(&id, message.receive_count),
                    body: message.body.clone(),
                    receive_count: message.receive_count,
                };
                state.in_flight.insert(id, now + self.visibility_timeout);
                received.push(item);
            }
        }

        if let Some(redrive) = &self.redrive {
            for letter in letters {
                tracing::warn!(
                    queue = %self.name,
                    attempts = letter.attempts,
                    dead_letter_queue = %redrive.dead_letters.name(),
                    "Receive budget exhausted, moving message to dead-letter queue"
                );
                redrive
                    .dead_letters
                    .send(serde_json::to_string(&letter)?)
                    .await?;
            }
        }

        Ok(received)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let Some(id) = state.current_receipt(receipt_handle) else {
            tracing::debug!(queue = %self.name, receipt_handle, "Ignoring ack for superseded receipt");
            return Ok(());
        };
        state.in_flight.remove(&id);
        state.messages.remove(&id);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let Some(id) = state.current_receipt(receipt_handle) else {
            return Ok(());
        };
        if let Some(message) = state.messages.get_mut(&id) {
            message.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let state = self.state.lock().await;
        let in_flight = state.in_flight.len() as u64;
        Ok(QueueDepth {
            visible: state.messages.len() as u64 - in_flight,
            in_flight,
        })
    }
}
