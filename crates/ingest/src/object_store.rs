//! Durable blob storage for uploaded batch objects.

use async_trait::async_trait;
use sqlx::PgPool;

use courier_common::error::AppError;

/// Write-once blob store keyed by `(bucket, key)`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a new object. Objects are immutable: writing an existing key fails.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<(), AppError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, AppError>;
}

/// Objects stored in the `batch_objects` table.
#[derive(Clone)]
pub struct PgObjectStore {
    pool: PgPool,
}

impl PgObjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ObjectStore for PgObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<(), AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO batch_objects (bucket, key, content_type, body, size_bytes)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (bucket, key) DO NOTHING
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(content_type)
        .bind(body)
        .bind(body.len() as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(AppError::Validation(format!(
                "Object {}/{} already exists",
                bucket, key
            )));
        }

        tracing::debug!(bucket, key, size_bytes = body.len(), "Object stored");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT body FROM batch_objects WHERE bucket = $1 AND key = $2")
                .bind(bucket)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(body,)| body))
    }
}
