use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier generated for every ingested record.
pub type RecordId = Uuid;

/// Notification that a batch object finished uploading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectCreatedEvent {
    pub bucket: String,
    pub key: String,
}

/// One parsed line of a batch object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub batch_key: String,
    pub line_number: i64,
    /// Field name → value, as produced by the line deserializer
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Row-level mutation kinds carried by the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Insert,
    Modify,
    Remove,
}

impl std::fmt::Display for ChangeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeEventType::Insert => write!(f, "INSERT"),
            ChangeEventType::Modify => write!(f, "MODIFY"),
            ChangeEventType::Remove => write!(f, "REMOVE"),
        }
    }
}

impl std::str::FromStr for ChangeEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(ChangeEventType::Insert),
            "MODIFY" => Ok(ChangeEventType::Modify),
            "REMOVE" => Ok(ChangeEventType::Remove),
            other => Err(format!("unknown change event type '{}'", other)),
        }
    }
}

/// One entry of the record table's change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    /// Position in the stream; strictly increasing in commit order
    pub seq: i64,
    pub shard: i32,
    pub partition_key: String,
    pub event_type: ChangeEventType,
    /// Full image of the row after the change (absent for REMOVE)
    pub new_image: Option<Record>,
    pub created_at: DateTime<Utc>,
}

/// Work-queue message derived 1:1 from a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub record_id: RecordId,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Inline body template with `{{field}}` placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub payload: serde_json::Value,
}

/// Envelope written to a dead-letter queue: the original body verbatim plus
/// failure metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Queue or stream the body came from
    pub source: String,
    pub body: String,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub failed_at: DateTime<Utc>,
}

/// Delivery status of a dispatched notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Sent,
    Bounced,
    Complained,
    Delivered,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Sent => write!(f, "SENT"),
            DeliveryStatus::Bounced => write!(f, "BOUNCED"),
            DeliveryStatus::Complained => write!(f, "COMPLAINED"),
            DeliveryStatus::Delivered => write!(f, "DELIVERED"),
        }
    }
}

/// Outcome kinds published by the delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeType {
    Bounce,
    Complaint,
    Delivery,
}

impl OutcomeType {
    /// Delivery status a record moves to when this outcome arrives.
    pub fn status(self) -> DeliveryStatus {
        match self {
            OutcomeType::Bounce => DeliveryStatus::Bounced,
            OutcomeType::Complaint => DeliveryStatus::Complained,
            OutcomeType::Delivery => DeliveryStatus::Delivered,
        }
    }
}

/// Delivery-outcome event received through the feedback topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcomeEvent {
    pub message_id: String,
    pub outcome_type: OutcomeType,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
}

/// One dispatched notification and its latest known status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    /// Identifier assigned by the delivery channel at send time
    pub message_id: String,
    pub record_id: RecordId,
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub status_updated_at: DateTime<Utc>,
}

/// Filters accepted by delivery record queries. All fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryQuery {
    pub recipient: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub record_id: Option<RecordId>,
    pub message_id: Option<String>,
    pub limit: Option<i64>,
}

impl DeliveryQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    /// Requested limit clamped to `1..=MAX_LIMIT`.
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, record: &DeliveryRecord) -> bool {
        self.recipient
            .as_ref()
            .is_none_or(|r| r.eq_ignore_ascii_case(&record.recipient))
            && self.status.is_none_or(|s| s == record.status)
            && self.record_id.is_none_or(|id| id == record.record_id)
            && self
                .message_id
                .as_ref()
                .is_none_or(|m| m == &record.message_id)
    }
}
