//! Publish/subscribe bridge: one published body is delivered to every
//! subscribed queue (raw message delivery, no envelope).

use std::sync::Arc;

use crate::{MessageQueue, QueueError};

pub struct Topic {
    name: String,
    subscribers: Vec<Arc<dyn MessageQueue>>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.subscribers.push(queue);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver `body` to every subscriber. Every subscriber is attempted; the
    /// first failure is returned after the others have been tried.
    pub async fn publish(&self, body: &str) -> Result<usize, QueueError> {
        let mut delivered = 0;
        let mut first_error = None;

        for queue in &self.subscribers {
            match queue.send(body.to_string()).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    tracing::error!(
                        topic = %self.name,
                        queue = %queue.name(),
                        error = %e,
                        "Failed to deliver topic message to subscriber"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }
}
