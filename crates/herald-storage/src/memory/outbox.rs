//! In-memory outbox store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use herald_common::{Clock, Envelope, OutboxEntry, OutboxPublishOptions, OutboxStatus};

use crate::contracts::OutboxStore;
use crate::error::StorageResult;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// BTreeMap-backed outbox keyed by a monotonic entry id, so claims drain
/// in staging order. Single-entry transitions happen under one lock,
/// which is what makes claim_pending atomic.
pub struct InMemoryOutboxStore {
    entries: Mutex<BTreeMap<u64, OutboxEntry>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    default_max_retries: u32,
}

impl InMemoryOutboxStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            clock,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    fn is_due(entry: &OutboxEntry, now: DateTime<Utc>) -> bool {
        entry.status == OutboxStatus::Pending
            && entry.next_retry_at.map_or(true, |at| at <= now)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add(
        &self,
        message: &Envelope,
        options: OutboxPublishOptions,
    ) -> StorageResult<OutboxEntry> {
        let now = self.clock.now();
        let entry = OutboxEntry {
            entry_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            message: message.clone(),
            destination: options.destination,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.default_max_retries),
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
        };
        self.entries.lock().insert(entry.entry_id, entry.clone());
        Ok(entry)
    }

    async fn get_pending(&self, limit: u32) -> StorageResult<Vec<OutboxEntry>> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        Ok(entries
            .values()
            .filter(|entry| Self::is_due(entry, now))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn claim_pending(
        &self,
        limit: u32,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<OutboxEntry>> {
        let mut entries = self.entries.lock();
        let due: Vec<u64> = entries
            .values()
            .filter(|entry| Self::is_due(entry, now))
            .take(limit as usize)
            .map(|entry| entry.entry_id)
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(entry) = entries.get_mut(&id) {
                entry.status = OutboxStatus::Processing;
                entry.claimed_by = Some(claimant.to_string());
                entry.claimed_at = Some(now);
                entry.updated_at = now;
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, entry_id: u64) -> StorageResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&entry_id) {
            Some(entry) => {
                entry.status = OutboxStatus::Processed;
                entry.updated_at = self.clock.now();
                entry.claimed_by = None;
                entry.claimed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, entry_id: u64, error: &str) -> StorageResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&entry_id) {
            Some(entry) => {
                entry.status = OutboxStatus::Failed;
                entry.last_error = Some(error.to_string());
                entry.updated_at = self.clock.now();
                entry.claimed_by = None;
                entry.claimed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_retry(
        &self,
        entry_id: u64,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StorageResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&entry_id) {
            Some(entry) => {
                entry.status = OutboxStatus::Pending;
                entry.retry_count = retry_count;
                entry.next_retry_at = next_retry_at;
                entry.updated_at = self.clock.now();
                entry.claimed_by = None;
                entry.claimed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_pending_count(&self) -> StorageResult<u64> {
        let entries = self.entries.lock();
        Ok(entries
            .values()
            .filter(|entry| entry.status == OutboxStatus::Pending)
            .count() as u64)
    }

    async fn get_failed(&self, limit: u32) -> StorageResult<Vec<OutboxEntry>> {
        let entries = self.entries.lock();
        Ok(entries
            .values()
            .filter(|entry| entry.status == OutboxStatus::Failed)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn reclaim_expired(&self, lease: Duration, now: DateTime<Utc>) -> StorageResult<u64> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| crate::error::StorageError::Invalid(e.to_string()))?;
        let mut entries = self.entries.lock();
        let mut reclaimed = 0;
        for entry in entries.values_mut() {
            if entry.status == OutboxStatus::Processing {
                let stale = entry.claimed_at.map_or(true, |at| now - at >= lease);
                if stale {
                    entry.status = OutboxStatus::Pending;
                    entry.claimed_by = None;
                    entry.claimed_at = None;
                    entry.updated_at = now;
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }
}
