//! In-memory message store

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use herald_common::{Clock, Envelope, MessageId};

use crate::contracts::{MessageFilter, MessageStore, StoreOptions};
use crate::error::{StorageError, StorageResult};

struct StoredMessage {
    envelope: Envelope,
    expires_at: Option<DateTime<Utc>>,
}

/// DashMap-backed message store with optional per-message TTL.
pub struct InMemoryMessageStore {
    messages: DashMap<MessageId, StoredMessage>,
    clock: Arc<dyn Clock>,
}

impl InMemoryMessageStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { messages: DashMap::new(), clock }
    }

    fn matches(envelope: &Envelope, filter: &MessageFilter) -> bool {
        if let Some(ref message_type) = filter.message_type {
            if envelope.message_type != *message_type {
                return false;
            }
        }
        if let Some(kind) = filter.kind {
            if envelope.kind != kind {
                return false;
            }
        }
        if let Some(ref correlation_id) = filter.correlation_id {
            if envelope.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = filter.since {
            if envelope.timestamp < since {
                return false;
            }
        }
        if let Some(until) = filter.until {
            if envelope.timestamp >= until {
                return false;
            }
        }
        true
    }

    fn live(&self, stored: &StoredMessage) -> bool {
        stored.expires_at.map_or(true, |at| at > self.clock.now())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn store(&self, message: &Envelope, options: StoreOptions) -> StorageResult<MessageId> {
        let expires_at = match options.ttl {
            Some(ttl) => Some(
                self.clock.now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| StorageError::Invalid(e.to_string()))?,
            ),
            None => None,
        };
        self.messages
            .insert(message.id, StoredMessage { envelope: message.clone(), expires_at });
        Ok(message.id)
    }

    async fn retrieve(&self, id: MessageId) -> StorageResult<Option<Envelope>> {
        Ok(self
            .messages
            .get(&id)
            .filter(|stored| self.live(stored))
            .map(|stored| stored.envelope.clone()))
    }

    async fn delete(&self, id: MessageId) -> StorageResult<bool> {
        Ok(self.messages.remove(&id).is_some())
    }

    async fn exists(&self, id: MessageId) -> StorageResult<bool> {
        Ok(self.messages.get(&id).map_or(false, |stored| self.live(&stored)))
    }

    async fn query(&self, filter: MessageFilter) -> StorageResult<Vec<Envelope>> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(self
            .messages
            .iter()
            .filter(|stored| self.live(stored))
            .filter(|stored| Self::matches(&stored.envelope, &filter))
            .take(limit)
            .map(|stored| stored.envelope.clone())
            .collect())
    }

    async fn update(&self, id: MessageId, message: &Envelope) -> StorageResult<bool> {
        match self.messages.get_mut(&id) {
            Some(mut stored) => {
                stored.envelope = message.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self, filter: Option<MessageFilter>) -> StorageResult<u64> {
        let filter = filter.unwrap_or_default();
        Ok(self
            .messages
            .iter()
            .filter(|stored| self.live(stored))
            .filter(|stored| Self::matches(&stored.envelope, &filter))
            .count() as u64)
    }

    async fn clear(&self) -> StorageResult<()> {
        self.messages.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::{system_clock, ManualClock, MessageKind};
    use std::time::Duration;

    fn event(message_type: &str) -> Envelope {
        Envelope::from_parts(MessageId::new(), MessageKind::Event, message_type, serde_json::json!({}))
    }

    #[tokio::test]
    async fn store_retrieve_delete() {
        let store = InMemoryMessageStore::new(system_clock());
        let message = event("a");
        let id = store.store(&message, StoreOptions::default()).await.unwrap();
        assert!(store.exists(id).await.unwrap());
        assert_eq!(store.retrieve(id).await.unwrap().unwrap().message_type, "a");
        assert!(store.delete(id).await.unwrap());
        assert!(!store.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn expired_messages_are_absent() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryMessageStore::new(clock.clone());
        let message = event("a");
        let id = store
            .store(&message, StoreOptions { ttl: Some(Duration::from_secs(10)) })
            .await
            .unwrap();
        assert!(store.exists(id).await.unwrap());
        clock.advance(Duration::from_secs(11));
        assert!(!store.exists(id).await.unwrap());
        assert!(store.retrieve(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_filters_by_type() {
        let store = InMemoryMessageStore::new(system_clock());
        store.store(&event("a"), StoreOptions::default()).await.unwrap();
        store.store(&event("a"), StoreOptions::default()).await.unwrap();
        store.store(&event("b"), StoreOptions::default()).await.unwrap();

        let found = store
            .query(MessageFilter { message_type: Some("a".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(store.count(None).await.unwrap(), 3);
    }
}
