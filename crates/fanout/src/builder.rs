//! Record → notification message conversion.

use serde_json::Value;
use thiserror::Error;

use courier_common::types::{NotificationMessage, Record};

/// A record that can never become a notification. Retrying will not help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("record {record_id} has no '{field}' field")]
    MissingRecipient { record_id: String, field: String },

    #[error("record {record_id} field '{field}' is not a usable address")]
    InvalidRecipient { record_id: String, field: String },
}

#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    recipient_field: String,
}

impl NotificationBuilder {
    pub const SUBJECT_FIELD: &'static str = "subject";
    pub const TEMPLATE_FIELD: &'static str = "template";

    pub fn new(recipient_field: impl Into<String>) -> Self {
        Self {
            recipient_field: recipient_field.into(),
        }
    }

    pub fn build(&self, record: &Record) -> Result<NotificationMessage, ConversionError> {
        let recipient = match record.payload.get(&self.recipient_field) {
            None | Some(Value::Null) => {
                return Err(ConversionError::MissingRecipient {
                    record_id: record.id.to_string(),
                    field: self.recipient_field.clone(),
                });
            }
            Some(Value::String(s)) if s.contains('@') && !s.trim().is_empty() => s.trim().to_string(),
            Some(_) => {
                return Err(ConversionError::InvalidRecipient {
                    record_id: record.id.to_string(),
                    field: self.recipient_field.clone(),
                });
            }
        };

        Ok(NotificationMessage {
            record_id: record.id,
            recipient,
            subject: text_field(&record.payload, Self::SUBJECT_FIELD),
            template: text_field(&record.payload, Self::TEMPLATE_FIELD),
            payload: record.payload.clone(),
        })
    }
}

fn text_field(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn record(payload: Value) -> Record {
        Record {
            id: Uuid::new_v4(),
            batch_key: "uploads/batch.csv".to_string(),
            line_number: 2,
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_build_message() {
        let record = record(json!({
            "email": " ada@example.com ",
            "subject": "Welcome",
            "name": "Ada"
        }));
        let message = NotificationBuilder::new("email").build(&record).unwrap();

        assert_eq!(message.record_id, record.id);
        assert_eq!(message.recipient, "ada@example.com");
        assert_eq!(message.subject.as_deref(), Some("Welcome"));
        assert!(message.template.is_none());
        assert_eq!(message.payload["name"], "Ada");
    }

    #[test]
    fn test_custom_recipient_field() {
        let record = record(json!({"contact": "grace@example.com"}));
        let message = NotificationBuilder::new("contact").build(&record).unwrap();
        assert_eq!(message.recipient, "grace@example.com");
    }

    #[test]
    fn test_missing_recipient() {
        let err = NotificationBuilder::new("email")
            .build(&record(json!({"name": "Ada"})))
            .unwrap_err();
        assert!(matches!(err, ConversionError::MissingRecipient { .. }));
    }

    #[test]
    fn test_invalid_recipient() {
        let err = NotificationBuilder::new("email")
            .build(&record(json!({"email": "not-an-address"})))
            .unwrap_err();
        assert!(matches!(err, ConversionError::InvalidRecipient { .. }));

        let err = NotificationBuilder::new("email")
            .build(&record(json!({"email": 42})))
            .unwrap_err();
        assert!(matches!(err, ConversionError::InvalidRecipient { .. }));
    }
}
