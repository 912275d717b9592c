//! Shared application state for the Axum API server.

use std::collections::HashMap;
use std::sync::Arc;

use courier_fanout::{NotificationBuilder, replay_fanout_dead_letters};
use courier_ingest::intake::ObjectIntake;
use courier_notifier::store::DeliveryStore;
use courier_queue::{MessageQueue, QueueError, ReplaySummary, Topic, replay_dead_letters};

/// Where the letters of one dead-letter queue go back to.
#[derive(Clone)]
pub enum DeadLetterRoute {
    /// Original bodies are sent back to the source queue verbatim.
    Queue {
        dead_letters: Arc<dyn MessageQueue>,
        source: Arc<dyn MessageQueue>,
    },
    /// Dead-lettered stream entries are rebuilt into notification messages.
    Stream {
        dead_letters: Arc<dyn MessageQueue>,
        work_queue: Arc<dyn MessageQueue>,
        builder: NotificationBuilder,
    },
}

impl DeadLetterRoute {
    pub fn dead_letters(&self) -> &dyn MessageQueue {
        match self {
            DeadLetterRoute::Queue { dead_letters, .. } => dead_letters.as_ref(),
            DeadLetterRoute::Stream { dead_letters, .. } => dead_letters.as_ref(),
        }
    }

    pub fn target(&self) -> &dyn MessageQueue {
        match self {
            DeadLetterRoute::Queue { source, .. } => source.as_ref(),
            DeadLetterRoute::Stream { work_queue, .. } => work_queue.as_ref(),
        }
    }

    pub async fn replay(&self, limit: usize) -> Result<ReplaySummary, QueueError> {
        match self {
            DeadLetterRoute::Queue {
                dead_letters,
                source,
            } => replay_dead_letters(dead_letters.as_ref(), source.as_ref(), limit).await,
            DeadLetterRoute::Stream {
                dead_letters,
                work_queue,
                builder,
            } => {
                replay_fanout_dead_letters(dead_letters.as_ref(), work_queue.as_ref(), builder, limit)
                    .await
            }
        }
    }
}

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<ObjectIntake>,
    pub deliveries: Arc<dyn DeliveryStore>,
    pub feedback_topic: Arc<Topic>,
    /// Keyed by the name used in `/admin/dead-letters/{queue}`
    pub dead_letter_routes: Arc<HashMap<String, DeadLetterRoute>>,
}

impl AppState {
    pub fn new(
        intake: Arc<ObjectIntake>,
        deliveries: Arc<dyn DeliveryStore>,
        feedback_topic: Arc<Topic>,
    ) -> Self {
        Self {
            intake,
            deliveries,
            feedback_topic,
            dead_letter_routes: Arc::new(HashMap::new()),
        }
    }

    pub fn with_dead_letter_routes(
        mut self,
        routes: impl IntoIterator<Item = (String, DeadLetterRoute)>,
    ) -> Self {
        self.dead_letter_routes = Arc::new(routes.into_iter().collect());
        self
    }
}
