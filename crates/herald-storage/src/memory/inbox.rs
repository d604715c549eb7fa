//! In-memory inbox store

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use herald_common::{Clock, Envelope, InboxEntry, InboxOptions, InboxStatus};

use crate::contracts::InboxStore;
use crate::error::{StorageError, StorageResult};

/// DashMap-backed inbox keyed by dedupe key. The insert in `add` is the
/// atomic check that enforces at-most-one non-Duplicate entry per key;
/// the only occupied key it may take over is a Failed entry whose
/// idempotency window has lapsed.
pub struct InMemoryInboxStore {
    entries: DashMap<String, InboxEntry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryInboxStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: DashMap::new(), clock }
    }

    fn fresh_entry(
        dedupe_key: &str,
        message: &Envelope,
        options: InboxOptions,
        now: DateTime<Utc>,
    ) -> InboxEntry {
        InboxEntry {
            id: dedupe_key.to_string(),
            message: message.clone(),
            status: InboxStatus::Pending,
            received_at: now,
            processed_at: None,
            error: None,
            options,
        }
    }

    /// A Failed entry blocks its key only within the idempotency window;
    /// past it (or with no window at all) the key is claimable again.
    fn reclaimable(
        existing: &InboxEntry,
        options: &InboxOptions,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        if existing.status != InboxStatus::Failed {
            return Ok(false);
        }
        match options.idempotency_window {
            None => Ok(true),
            Some(window) => {
                let window = chrono::Duration::from_std(window)
                    .map_err(|e| StorageError::Invalid(e.to_string()))?;
                Ok(now - existing.received_at >= window)
            }
        }
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn add(
        &self,
        dedupe_key: &str,
        message: &Envelope,
        options: InboxOptions,
    ) -> StorageResult<Option<InboxEntry>> {
        let now = self.clock.now();
        match self.entries.entry(dedupe_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if !Self::reclaimable(slot.get(), &options, now)? {
                    return Ok(None);
                }
                let entry = Self::fresh_entry(dedupe_key, message, options, now);
                slot.insert(entry.clone());
                Ok(Some(entry))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let entry = Self::fresh_entry(dedupe_key, message, options, now);
                slot.insert(entry.clone());
                Ok(Some(entry))
            }
        }
    }

    async fn is_duplicate(
        &self,
        dedupe_key: &str,
        window: Option<Duration>,
    ) -> StorageResult<bool> {
        let Some(entry) = self.entries.get(dedupe_key) else {
            return Ok(false);
        };
        match entry.status {
            InboxStatus::Processed | InboxStatus::Duplicate | InboxStatus::Pending => Ok(true),
            InboxStatus::Failed => {
                let Some(window) = window else { return Ok(false) };
                let window = chrono::Duration::from_std(window)
                    .map_err(|e| StorageError::Invalid(e.to_string()))?;
                Ok(self.clock.now() - entry.received_at < window)
            }
        }
    }

    async fn get(&self, dedupe_key: &str) -> StorageResult<Option<InboxEntry>> {
        Ok(self.entries.get(dedupe_key).map(|entry| entry.clone()))
    }

    async fn mark_processed(&self, dedupe_key: &str) -> StorageResult<bool> {
        match self.entries.get_mut(dedupe_key) {
            Some(mut entry) => {
                entry.status = InboxStatus::Processed;
                entry.processed_at = Some(self.clock.now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, dedupe_key: &str, error: &str) -> StorageResult<bool> {
        match self.entries.get_mut(dedupe_key) {
            Some(mut entry) => {
                entry.status = InboxStatus::Failed;
                entry.error = Some(error.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_unprocessed(&self, limit: u32) -> StorageResult<Vec<InboxEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.status == InboxStatus::Pending)
            .take(limit as usize)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn get_unprocessed_count(&self) -> StorageResult<u64> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.status == InboxStatus::Pending)
            .count() as u64)
    }

    async fn cleanup_old_entries(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !(entry.status == InboxStatus::Processed
                && entry.processed_at.map_or(false, |at| at < older_than))
        });
        Ok((before - self.entries.len()) as u64)
    }
}
