use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use courier_common::error::AppError;
use courier_common::types::{DeliveryQuery, DeliveryRecord, DeliveryStatus, RecordId};

use crate::store::{DeliveryStore, OutcomeApplied};

/// Delivery records held in process memory.
#[derive(Default)]
pub struct InMemoryDeliveryStore {
    records: RwLock<Vec<DeliveryRecord>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn insert(&self, record: &DeliveryRecord) -> Result<bool, AppError> {
        let mut records = self.records.write().await;
        if records
            .iter()
            .any(|r| r.record_id == record.record_id || r.message_id == record.message_id)
        {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<DeliveryRecord>, AppError> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.message_id == message_id).cloned())
    }

    async fn find_by_record_id(&self, record_id: RecordId) -> Result<Option<DeliveryRecord>, AppError> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.record_id == record_id).cloned())
    }

    async fn apply_outcome(
        &self,
        message_id: &str,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<OutcomeApplied, AppError> {
        let mut records = self.records.write().await;
        let Some(record) = records.iter_mut().find(|r| r.message_id == message_id) else {
            return Ok(OutcomeApplied::UnknownMessage);
        };

        if record.status != DeliveryStatus::Sent && record.status_updated_at > at {
            return Ok(OutcomeApplied::Stale);
        }

        record.status = status;
        record.status_updated_at = record.status_updated_at.max(at);
        Ok(OutcomeApplied::Updated)
    }

    async fn query(&self, query: &DeliveryQuery) -> Result<Vec<DeliveryRecord>, AppError> {
        let records = self.records.read().await;
        let mut matched: Vec<DeliveryRecord> =
            records.iter().filter(|r| query.matches(r)).cloned().collect();
        matched.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        matched.truncate(query.effective_limit() as usize);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;

    fn sent(message_id: &str, recipient: &str) -> DeliveryRecord {
        let now = Utc::now();
        DeliveryRecord {
            message_id: message_id.to_string(),
            record_id: Uuid::new_v4(),
            recipient: recipient.to_string(),
            sent_at: now,
            status: DeliveryStatus::Sent,
            status_updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_second_dispatch_of_record() {
        let store = InMemoryDeliveryStore::new();
        let first = sent("m1", "a@example.com");
        assert!(store.insert(&first).await.unwrap());

        let again = DeliveryRecord {
            message_id: "m2".to_string(),
            ..first.clone()
        };
        assert!(!store.insert(&again).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_outcome_supersedes_sent_even_if_timestamp_is_older() {
        let store = InMemoryDeliveryStore::new();
        let record = sent("m1", "a@example.com");
        store.insert(&record).await.unwrap();

        let early = record.sent_at - Duration::seconds(2);
        let applied = store.apply_outcome("m1", DeliveryStatus::Bounced, early).await.unwrap();
        assert_eq!(applied, OutcomeApplied::Updated);

        let stored = store.find_by_message_id("m1").await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Bounced);
        assert_eq!(stored.status_updated_at, record.status_updated_at);
    }

    #[tokio::test]
    async fn test_stale_outcome_ignored() {
        let store = InMemoryDeliveryStore::new();
        store.insert(&sent("m1", "a@example.com")).await.unwrap();

        let later = Utc::now() + Duration::minutes(5);
        store
            .apply_outcome("m1", DeliveryStatus::Complained, later)
            .await
            .unwrap();
        let applied = store
            .apply_outcome("m1", DeliveryStatus::Delivered, later - Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(applied, OutcomeApplied::Stale);
        let stored = store.find_by_message_id("m1").await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Complained);
    }

    #[tokio::test]
    async fn test_unknown_message() {
        let store = InMemoryDeliveryStore::new();
        let applied = store
            .apply_outcome("nope", DeliveryStatus::Bounced, Utc::now())
            .await
            .unwrap();
        assert_eq!(applied, OutcomeApplied::UnknownMessage);
    }

    #[tokio::test]
    async fn test_query_filters_and_limit() {
        let store = InMemoryDeliveryStore::new();
        store.insert(&sent("m1", "Ada@example.com")).await.unwrap();
        store.insert(&sent("m2", "grace@example.com")).await.unwrap();
        store.insert(&sent("m3", "ada@example.com")).await.unwrap();

        let by_recipient = store
            .query(&DeliveryQuery {
                recipient: Some("ADA@example.com".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_recipient.len(), 2);

        let limited = store
            .query(&DeliveryQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
