//! Object intake: store an upload, then announce it on the object-events queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::ObjectCreatedEvent;
use courier_queue::{MessageQueue, send_json};

use crate::object_store::ObjectStore;

const DEFAULT_FILENAME: &str = "batch.csv";
const MAX_FILENAME_LEN: usize = 100;

pub struct ObjectIntake {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn MessageQueue>,
    bucket: String,
}

impl ObjectIntake {
    pub fn new(store: Arc<dyn ObjectStore>, events: Arc<dyn MessageQueue>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            events,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Store `body` under a freshly generated key and emit the object-created
    /// event. Returns once the object is durable; ingestion happens later.
    pub async fn upload(
        &self,
        filename: Option<&str>,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<ObjectCreatedEvent, AppError> {
        if body.is_empty() {
            return Err(AppError::Validation("Upload body is empty".to_string()));
        }

        let key = object_key(filename, Utc::now(), Uuid::new_v4());
        self.store.put(&self.bucket, &key, content_type, body).await?;

        let event = ObjectCreatedEvent {
            bucket: self.bucket.clone(),
            key,
        };

        if let Err(e) = send_json(self.events.as_ref(), &event).await {
            tracing::error!(
                bucket = %event.bucket,
                key = %event.key,
                error = %e,
                "Object stored but creation event could not be published"
            );
            return Err(e.into());
        }

        tracing::info!(
            bucket = %event.bucket,
            key = %event.key,
            size_bytes = body.len(),
            "Batch object uploaded"
        );

        Ok(event)
    }
}

/// `uploads/<yyyy>/<mm>/<dd>/<uuid>-<filename>`; the filename is reduced to
/// `[A-Za-z0-9._-]`.
pub fn object_key(filename: Option<&str>, now: DateTime<Utc>, id: Uuid) -> String {
    let name: String = filename
        .unwrap_or(DEFAULT_FILENAME)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect();
    let name = if name.trim_matches(['.', '_']).is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        name
    };

    format!("uploads/{}/{}-{}", now.format("%Y/%m/%d"), id, name)
}
