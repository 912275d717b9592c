//! Record table and its change stream.
//!
//! Records are append-only. Every insert appends an `INSERT` entry carrying
//! the full record image to the change stream in the same transaction, so the
//! stream never misses or invents a row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use courier_common::error::AppError;
use courier_common::types::{ChangeEventType, ObjectCreatedEvent, Record, RecordId, StreamEntry};

/// Advisory lock serializing stream appends so `seq` order matches commit order.
const STREAM_APPEND_LOCK: i64 = 0x636f_7572_6965_72;

/// Shard of a partition key: 32-bit FNV-1a modulo `shard_count`.
pub fn shard_for(partition_key: &str, shard_count: u32) -> i32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in partition_key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash % shard_count.max(1)) as i32
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write all records of one batch object, their stream entries and the
    /// batch's ingestion ledger row atomically.
    ///
    /// Returns `false` without writing anything if the object was already ingested.
    async fn write_batch(
        &self,
        batch: &ObjectCreatedEvent,
        records: &[Record],
        rejected_lines: usize,
    ) -> Result<bool, AppError>;

    async fn get(&self, id: RecordId) -> Result<Option<Record>, AppError>;

    async fn list_by_batch(&self, batch_key: &str) -> Result<Vec<Record>, AppError>;
}

/// Ordered, per-shard feed of record mutations with consumer checkpoints.
#[async_trait]
pub trait ChangeStream: Send + Sync {
    /// Entries of `shard` with `seq > after_seq`, oldest first.
    async fn read(&self, shard: i32, after_seq: i64, limit: usize) -> Result<Vec<StreamEntry>, AppError>;

    /// Last committed position of `consumer` on `shard`; 0 (the trim horizon)
    /// when the consumer has never committed.
    async fn checkpoint(&self, consumer: &str, shard: i32) -> Result<i64, AppError>;

    /// Advance the checkpoint. Never moves backwards.
    async fn commit(&self, consumer: &str, shard: i32, seq: i64) -> Result<(), AppError>;

    /// Drop entries created before `cutoff`. Returns the number removed.
    async fn trim_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Postgres-backed record table (`records`) and stream (`record_stream`).
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    shard_count: u32,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, shard_count: u32) -> Self {
        Self { pool, shard_count }
    }
}

#[derive(sqlx::FromRow)]
struct StreamRow {
    seq: i64,
    shard: i32,
    partition_key: String,
    event_type: String,
    new_image: Option<Json<Record>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<StreamRow> for StreamEntry {
    type Error = AppError;

    fn try_from(row: StreamRow) -> Result<Self, Self::Error> {
        Ok(StreamEntry {
            seq: row.seq,
            shard: row.shard,
            partition_key: row.partition_key,
            event_type: row.event_type.parse().map_err(AppError::Parse)?,
            new_image: row.new_image.map(|Json(record)| record),
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn write_batch(
        &self,
        batch: &ObjectCreatedEvent,
        records: &[Record],
        rejected_lines: usize,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO ingested_batches (bucket, key, record_count, rejected_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (bucket, key) DO NOTHING
            "#,
        )
        .bind(&batch.bucket)
        .bind(&batch.key)
        .bind(records.len() as i32)
        .bind(rejected_lines as i32)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(STREAM_APPEND_LOCK)
            .execute(&mut *tx)
            .await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO records (id, batch_key, line_number, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.id)
            .bind(&record.batch_key)
            .bind(record.line_number)
            .bind(&record.payload)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;

            let partition_key = record.id.to_string();
            sqlx::query(
                r#"
                INSERT INTO record_stream (shard, partition_key, event_type, new_image)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(shard_for(&partition_key, self.shard_count))
            .bind(&partition_key)
            .bind(ChangeEventType::Insert.to_string())
            .bind(Json(record))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get(&self, id: RecordId) -> Result<Option<Record>, AppError> {
        let record: Option<Record> = sqlx::query_as("SELECT * FROM records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_by_batch(&self, batch_key: &str) -> Result<Vec<Record>, AppError> {
        let records: Vec<Record> =
            sqlx::query_as("SELECT * FROM records WHERE batch_key = $1 ORDER BY line_number")
                .bind(batch_key)
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }
}

#[async_trait]
impl ChangeStream for PgRecordStore {
    async fn read(&self, shard: i32, after_seq: i64, limit: usize) -> Result<Vec<StreamEntry>, AppError> {
        let rows: Vec<StreamRow> = sqlx::query_as(
            r#"
            SELECT seq, shard, partition_key, event_type, new_image, created_at
            FROM record_stream
            WHERE shard = $1 AND seq > $2
            ORDER BY seq
            LIMIT $3
            "#,
        )
        .bind(shard)
        .bind(after_seq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StreamEntry::try_from).collect()
    }

    async fn checkpoint(&self, consumer: &str, shard: i32) -> Result<i64, AppError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT last_seq FROM stream_checkpoints WHERE consumer = $1 AND shard = $2",
        )
        .bind(consumer)
        .bind(shard)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(seq,)| seq).unwrap_or(0))
    }

    async fn commit(&self, consumer: &str, shard: i32, seq: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO stream_checkpoints (consumer, shard, last_seq)
            VALUES ($1, $2, $3)
            ON CONFLICT (consumer, shard) DO UPDATE
            SET last_seq = GREATEST(stream_checkpoints.last_seq, EXCLUDED.last_seq),
                updated_at = NOW()
            "#,
        )
        .bind(consumer)
        .bind(shard)
        .bind(seq)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn trim_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let removed = sqlx::query("DELETE FROM record_stream WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "Trimmed change stream");
        }
        Ok(removed)
    }
}
