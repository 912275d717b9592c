//! In-memory object and record stores for tests and single-process runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use courier_common::error::AppError;
use courier_common::types::{ChangeEventType, ObjectCreatedEvent, Record, RecordId, StreamEntry};

use crate::object_store::ObjectStore;
use crate::record_store::{ChangeStream, RecordStore, shard_for};

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        _content_type: Option<&str>,
        body: &[u8],
    ) -> Result<(), AppError> {
        let mut objects = self.objects.lock().await;
        let id = (bucket.to_string(), key.to_string());
        if objects.contains_key(&id) {
            return Err(AppError::Validation(format!(
                "Object {}/{} already exists",
                bucket, key
            )));
        }
        objects.insert(id, body.to_vec());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }
}

#[derive(Default)]
struct RecordState {
    records: Vec<Record>,
    stream: Vec<StreamEntry>,
    next_seq: i64,
    ingested: HashSet<(String, String)>,
    checkpoints: HashMap<(String, i32), i64>,
}

impl RecordState {
    fn append(&mut self, shard_count: u32, event_type: ChangeEventType, partition_key: String, image: Option<Record>) -> i64 {
        self.next_seq += 1;
        self.stream.push(StreamEntry {
            seq: self.next_seq,
            shard: shard_for(&partition_key, shard_count),
            partition_key,
            event_type,
            new_image: image,
            created_at: Utc::now(),
        });
        self.next_seq
    }
}

/// Record table plus change stream held in process memory.
pub struct InMemoryRecordStore {
    shard_count: u32,
    state: Mutex<RecordState>,
}

impl InMemoryRecordStore {
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count,
            state: Mutex::new(RecordState::default()),
        }
    }

    /// Append an arbitrary stream entry, e.g. a MODIFY or REMOVE the record
    /// store itself never produces. Returns its seq.
    pub async fn append_change(
        &self,
        event_type: ChangeEventType,
        partition_key: &str,
        image: Option<Record>,
    ) -> i64 {
        let mut state = self.state.lock().await;
        state.append(self.shard_count, event_type, partition_key.to_string(), image)
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn stream_len(&self) -> usize {
        self.state.lock().await.stream.len()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn write_batch(
        &self,
        batch: &ObjectCreatedEvent,
        records: &[Record],
        _rejected_lines: usize,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        if !state
            .ingested
            .insert((batch.bucket.clone(), batch.key.clone()))
        {
            return Ok(false);
        }

        for record in records {
            state.records.push(record.clone());
            state.append(
                self.shard_count,
                ChangeEventType::Insert,
                record.id.to_string(),
                Some(record.clone()),
            );
        }
        Ok(true)
    }

    async fn get(&self, id: RecordId) -> Result<Option<Record>, AppError> {
        let state = self.state.lock().await;
        Ok(state.records.iter().find(|r| r.id == id).cloned())
    }

    async fn list_by_batch(&self, batch_key: &str) -> Result<Vec<Record>, AppError> {
        let state = self.state.lock().await;
        let mut records: Vec<Record> = state
            .records
            .iter()
            .filter(|r| r.batch_key == batch_key)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.line_number);
        Ok(records)
    }
}

#[async_trait]
impl ChangeStream for InMemoryRecordStore {
    async fn read(&self, shard: i32, after_seq: i64, limit: usize) -> Result<Vec<StreamEntry>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .stream
            .iter()
            .filter(|e| e.shard == shard && e.seq > after_seq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn checkpoint(&self, consumer: &str, shard: i32) -> Result<i64, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .checkpoints
            .get(&(consumer.to_string(), shard))
            .copied()
            .unwrap_or(0))
    }

    async fn commit(&self, consumer: &str, shard: i32, seq: i64) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let position = state
            .checkpoints
            .entry((consumer.to_string(), shard))
            .or_insert(0);
        *position = (*position).max(seq);
        Ok(())
    }

    async fn trim_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().await;
        let before = state.stream.len();
        state.stream.retain(|e| e.created_at >= cutoff);
        Ok((before - state.stream.len()) as u64)
    }
}
