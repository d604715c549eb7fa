//! In-memory dead letter store

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use herald_common::{Clock, DeadLetterContext, DeadLetterEntry, DeadLetterStats, Envelope, MessageId};

use crate::contracts::DeadLetterStore;
use crate::error::StorageResult;

pub struct InMemoryDeadLetterStore {
    entries: DashMap<MessageId, DeadLetterEntry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDeadLetterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: DashMap::new(), clock }
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn send_to_dead_letter(
        &self,
        message: &Envelope,
        context: DeadLetterContext,
    ) -> StorageResult<MessageId> {
        let dead_letter_id = MessageId::new();
        let entry = DeadLetterEntry {
            dead_letter_id,
            message: message.clone(),
            reason: context.reason,
            component: context.component,
            retry_count: context.retry_count,
            failure_time: self.clock.now(),
            error: context.error,
            metadata: Default::default(),
        };
        self.entries.insert(dead_letter_id, entry);
        Ok(dead_letter_id)
    }

    async fn get_dead_letters(&self, limit: u32) -> StorageResult<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> =
            self.entries.iter().map(|entry| entry.clone()).collect();
        entries.sort_by_key(|entry| entry.failure_time);
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn retry(&self, dead_letter_id: MessageId) -> StorageResult<Option<DeadLetterEntry>> {
        Ok(self.entries.remove(&dead_letter_id).map(|(_, entry)| entry))
    }

    async fn discard(&self, dead_letter_id: MessageId) -> StorageResult<bool> {
        Ok(self.entries.remove(&dead_letter_id).is_some())
    }

    async fn count(&self) -> StorageResult<u64> {
        Ok(self.entries.len() as u64)
    }

    async fn statistics(&self) -> StorageResult<DeadLetterStats> {
        let mut stats = DeadLetterStats { total: self.entries.len() as u64, ..Default::default() };
        for entry in self.entries.iter() {
            *stats.by_component.entry(entry.component.clone()).or_default() += 1;
            *stats.by_reason.entry(entry.reason.clone()).or_default() += 1;
        }
        Ok(stats)
    }
}
