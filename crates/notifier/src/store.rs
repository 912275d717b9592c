//! Delivery record persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use courier_common::error::AppError;
use courier_common::types::{DeliveryQuery, DeliveryRecord, DeliveryStatus, RecordId};

/// Result of applying a delivery outcome to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeApplied {
    Updated,
    /// The record already carries a newer outcome
    Stale,
    UnknownMessage,
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert a new record. Returns `false` if the record id was already
    /// dispatched.
    async fn insert(&self, record: &DeliveryRecord) -> Result<bool, AppError>;

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<DeliveryRecord>, AppError>;

    async fn find_by_record_id(&self, record_id: RecordId) -> Result<Option<DeliveryRecord>, AppError>;

    /// Move a record to `status` as of `at`.
    ///
    /// SENT is always superseded. Between outcomes the later `at` wins.
    async fn apply_outcome(
        &self,
        message_id: &str,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<OutcomeApplied, AppError>;

    /// Records matching every filter of `query`, newest first.
    async fn query(&self, query: &DeliveryQuery) -> Result<Vec<DeliveryRecord>, AppError>;
}

#[derive(Clone)]
pub struct PgDeliveryStore {
    pool: PgPool,
}

impl PgDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryStore for PgDeliveryStore {
    async fn insert(&self, record: &DeliveryRecord) -> Result<bool, AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO delivery_records (message_id, record_id, recipient, sent_at, status, status_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&record.message_id)
        .bind(record.record_id)
        .bind(&record.recipient)
        .bind(record.sent_at)
        .bind(record.status.to_string())
        .bind(record.status_updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted > 0)
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<DeliveryRecord>, AppError> {
        let record: Option<DeliveryRecord> =
            sqlx::query_as("SELECT * FROM delivery_records WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn find_by_record_id(&self, record_id: RecordId) -> Result<Option<DeliveryRecord>, AppError> {
        let record: Option<DeliveryRecord> =
            sqlx::query_as("SELECT * FROM delivery_records WHERE record_id = $1")
                .bind(record_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn apply_outcome(
        &self,
        message_id: &str,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<OutcomeApplied, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = $2,
                status_updated_at = GREATEST(status_updated_at, $3)
            WHERE message_id = $1
              AND (status = $4 OR status_updated_at <= $3)
            "#,
        )
        .bind(message_id)
        .bind(status.to_string())
        .bind(at)
        .bind(DeliveryStatus::Sent.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(OutcomeApplied::Updated);
        }

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT message_id FROM delivery_records WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match exists {
            Some(_) => OutcomeApplied::Stale,
            None => OutcomeApplied::UnknownMessage,
        })
    }

    async fn query(&self, query: &DeliveryQuery) -> Result<Vec<DeliveryRecord>, AppError> {
        let records: Vec<DeliveryRecord> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_records
            WHERE ($1::TEXT IS NULL OR LOWER(recipient) = LOWER($1))
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::UUID IS NULL OR record_id = $3)
              AND ($4::TEXT IS NULL OR message_id = $4)
            ORDER BY sent_at DESC
            LIMIT $5
            "#,
        )
        .bind(query.recipient.as_deref())
        .bind(query.status.map(|s| s.to_string()))
        .bind(query.record_id)
        .bind(query.message_id.as_deref())
        .bind(query.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
