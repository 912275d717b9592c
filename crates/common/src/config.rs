use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Pipeline configuration loaded from environment variables.
///
/// Every worker receives a clone of this struct at startup; nothing reads the
/// environment after `from_env` returns.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (queue backend)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Bucket name stamped on uploaded batch objects
    pub object_bucket: String,

    /// Queue carrying object-created events to the ingest worker
    pub queue_object_events: String,

    /// Work queue carrying notification messages to the dispatcher
    pub queue_notifications: String,

    /// Queue bridged to the email feedback topic
    pub queue_feedback: String,

    /// Dead-letter queue for change-stream entries the fanout gave up on
    pub queue_fanout_dlq: String,

    /// How long a received message stays invisible before redelivery (default: 30)
    pub queue_visibility_timeout_secs: u64,

    /// Receives allowed before a message is dead-lettered (default: 5)
    pub queue_max_receive_count: u32,

    /// Idle sleep between empty receives in milliseconds (default: 1000)
    pub queue_poll_interval_ms: u64,

    /// Change-stream entries per fanout micro-batch (default: 5)
    pub fanout_batch_size: usize,

    /// Enqueue attempts per stream entry before dead-lettering (default: 10)
    pub fanout_max_attempts: u32,

    /// Base delay for fanout retry backoff in milliseconds (default: 200)
    pub fanout_retry_base_ms: u64,

    /// Number of change-stream shards, one fanout loop each (default: 1)
    pub fanout_shards: u32,

    /// Change-stream retention window in hours (default: 24)
    pub stream_retention_hours: u64,

    /// Messages per dispatcher invocation (default: 10)
    pub dispatch_batch_size: usize,

    /// Outcome events per feedback invocation (default: 10)
    pub feedback_batch_size: usize,

    /// Record payload field holding the recipient address (default: "email")
    pub recipient_field: String,

    /// Resend API key for email delivery; the logging sender is used when unset
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Gateway listen port (default: 3000)
    pub api_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            object_bucket: string_var("OBJECT_BUCKET", "courier-uploads"),
            queue_object_events: string_var("QUEUE_OBJECT_EVENTS", "object-events"),
            queue_notifications: string_var("QUEUE_NOTIFICATIONS", "notifications"),
            queue_feedback: string_var("QUEUE_FEEDBACK", "email-feedback"),
            queue_fanout_dlq: string_var("QUEUE_FANOUT_DLQ", "fanout-dlq"),
            queue_visibility_timeout_secs: parse_var("QUEUE_VISIBILITY_TIMEOUT_SECS", 30)?,
            queue_max_receive_count: parse_var("QUEUE_MAX_RECEIVE_COUNT", 5)?,
            queue_poll_interval_ms: parse_var("QUEUE_POLL_INTERVAL_MS", 1000)?,
            fanout_batch_size: parse_var("FANOUT_BATCH_SIZE", 5)?,
            fanout_max_attempts: parse_var("FANOUT_MAX_ATTEMPTS", 10)?,
            fanout_retry_base_ms: parse_var("FANOUT_RETRY_BASE_MS", 200)?,
            fanout_shards: parse_var("FANOUT_SHARDS", 1)?,
            stream_retention_hours: parse_var("STREAM_RETENTION_HOURS", 24)?,
            dispatch_batch_size: parse_var("DISPATCH_BATCH_SIZE", 10)?,
            feedback_batch_size: parse_var("FEEDBACK_BATCH_SIZE", 10)?,
            recipient_field: string_var("RECIPIENT_FIELD", "email"),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            api_port: parse_var("API_PORT", 3000)?,
        })
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    /// Name of the dead-letter queue paired with `queue`.
    pub fn dead_letter_queue_name(queue: &str) -> String {
        format!("{}-dlq", queue)
    }
}

fn string_var(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
