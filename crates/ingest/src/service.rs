//! Turns one stored batch object into records.

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use thiserror::Error;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{ObjectCreatedEvent, Record, RecordId};

use crate::deserializer::{LineError, RecordDeserializer};
use crate::object_store::ObjectStore;
use crate::record_store::RecordStore;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Object {bucket}/{key} not found")]
    ObjectNotFound { bucket: String, key: String },

    #[error("Object {key} is not valid UTF-8")]
    NotUtf8 { key: String },

    #[error(transparent)]
    Store(#[from] AppError),
}

/// What happened to one batch object.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub bucket: String,
    pub key: String,
    pub record_ids: Vec<RecordId>,
    pub rejected: Vec<LineError>,
    /// The object had already been ingested; nothing was written
    pub duplicate: bool,
}

pub struct IngestService {
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordStore>,
    deserializer: Arc<dyn RecordDeserializer>,
}

impl IngestService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
        deserializer: Arc<dyn RecordDeserializer>,
    ) -> Self {
        Self {
            objects,
            records,
            deserializer,
        }
    }

    /// Fetch the object named by `event`, parse it line by line and write
    /// every well-formed line as a record.
    ///
    /// Malformed lines are logged and reported; they never fail the batch.
    pub async fn ingest(&self, event: &ObjectCreatedEvent) -> Result<IngestReport, IngestError> {
        let body = self
            .objects
            .get(&event.bucket, &event.key)
            .await?
            .ok_or_else(|| IngestError::ObjectNotFound {
                bucket: event.bucket.clone(),
                key: event.key.clone(),
            })?;

        let text = String::from_utf8(body).map_err(|_| IngestError::NotUtf8 {
            key: event.key.clone(),
        })?;

        // Postgres keeps microseconds; the stream image must equal the stored row.
        let created_at = Utc::now().trunc_subsecs(6);
        let mut records = Vec::new();
        let mut rejected = Vec::new();

        for line in self.deserializer.deserialize(&text) {
            match line {
                Ok(parsed) => records.push(Record {
                    id: Uuid::new_v4(),
                    batch_key: event.key.clone(),
                    line_number: parsed.line_number,
                    payload: serde_json::Value::Object(parsed.fields),
                    created_at,
                }),
                Err(e) => {
                    tracing::warn!(
                        bucket = %event.bucket,
                        key = %event.key,
                        line = e.line_number,
                        reason = %e.reason,
                        "Rejected malformed line"
                    );
                    rejected.push(e);
                }
            }
        }

        let written = self
            .records
            .write_batch(event, &records, rejected.len())
            .await?;

        if !written {
            tracing::info!(
                bucket = %event.bucket,
                key = %event.key,
                "Batch object already ingested, skipping"
            );
            return Ok(IngestReport {
                bucket: event.bucket.clone(),
                key: event.key.clone(),
                record_ids: Vec::new(),
                rejected: Vec::new(),
                duplicate: true,
            });
        }

        tracing::info!(
            bucket = %event.bucket,
            key = %event.key,
            records = records.len(),
            rejected = rejected.len(),
            "Batch object ingested"
        );

        Ok(IngestReport {
            bucket: event.bucket.clone(),
            key: event.key.clone(),
            record_ids: records.iter().map(|r| r.id).collect(),
            rejected,
            duplicate: false,
        })
    }
}
