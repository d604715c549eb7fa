//! In-memory scheduled message store

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use herald_common::{Clock, MessageId, ScheduleStatus, ScheduledMessage};

use crate::contracts::ScheduledMessageStore;
use crate::error::{StorageError, StorageResult};

pub struct InMemoryScheduledMessageStore {
    entries: DashMap<MessageId, ScheduledMessage>,
    clock: Arc<dyn Clock>,
}

impl InMemoryScheduledMessageStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: DashMap::new(), clock }
    }
}

#[async_trait]
impl ScheduledMessageStore for InMemoryScheduledMessageStore {
    async fn add(&self, scheduled: &ScheduledMessage) -> StorageResult<()> {
        self.entries.insert(scheduled.id, scheduled.clone());
        Ok(())
    }

    async fn get(&self, id: MessageId) -> StorageResult<Option<ScheduledMessage>> {
        Ok(self.entries.get(&id).map(|entry| entry.clone()))
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        look_ahead: Duration,
        limit: u32,
    ) -> StorageResult<Vec<ScheduledMessage>> {
        let horizon = now
            + chrono::Duration::from_std(look_ahead)
                .map_err(|e| StorageError::Invalid(e.to_string()))?;
        let mut claimed = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if claimed.len() >= limit as usize {
                break;
            }
            if entry.status == ScheduleStatus::Scheduled && entry.scheduled_for <= horizon {
                entry.status = ScheduleStatus::Delivering;
                entry.claimed_at = Some(now);
                claimed.push(entry.clone());
            }
        }
        claimed.sort_by_key(|entry| entry.scheduled_for);
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: MessageId) -> StorageResult<bool> {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.status = ScheduleStatus::Delivered;
                entry.claimed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, id: MessageId, error: &str) -> StorageResult<bool> {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.status = ScheduleStatus::Failed;
                entry.last_error = Some(error.to_string());
                entry.claimed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancel(&self, id: MessageId) -> StorageResult<bool> {
        match self.entries.get_mut(&id) {
            Some(mut entry) if entry.status == ScheduleStatus::Scheduled => {
                entry.status = ScheduleStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(&self, id: MessageId, next: DateTime<Utc>) -> StorageResult<bool> {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.status = ScheduleStatus::Scheduled;
                entry.scheduled_for = next;
                entry.claimed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_expired(
        &self,
        claim_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let timeout = chrono::Duration::from_std(claim_timeout)
            .map_err(|e| StorageError::Invalid(e.to_string()))?;
        let mut reclaimed = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.status == ScheduleStatus::Delivering {
                let stale = entry.claimed_at.map_or(true, |at| now - at >= timeout);
                if stale {
                    entry.status = ScheduleStatus::Scheduled;
                    entry.claimed_at = None;
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }

    async fn get_due_count(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.status == ScheduleStatus::Scheduled && entry.scheduled_for <= now)
            .count() as u64)
    }
}
