//! In-memory named-queue store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use herald_common::{Clock, EnqueueOptions, Envelope, MessageId, QueueEntry};

use crate::contracts::QueueStore;
use crate::error::{StorageError, StorageResult};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Default)]
struct QueueState {
    /// Not-yet-leased entries, enqueue order.
    ready: Vec<QueueEntry>,
    /// Leased entries awaiting acknowledge/reject.
    leased: HashMap<MessageId, QueueEntry>,
}

/// Per-queue mutex-guarded state. Lease expiry is reclaimed lazily on
/// every dequeue, so a dead consumer's entries come back without a
/// background task.
pub struct InMemoryQueueStore {
    queues: DashMap<String, Mutex<QueueState>>,
    clock: Arc<dyn Clock>,
    lease_timeout: Duration,
}

impl InMemoryQueueStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { queues: DashMap::new(), clock, lease_timeout: DEFAULT_LEASE }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    fn reclaim_expired(state: &mut QueueState, now: DateTime<Utc>) {
        let expired: Vec<MessageId> = state
            .leased
            .iter()
            .filter(|(_, entry)| entry.lease_expiry.map_or(false, |at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut entry) = state.leased.remove(&id) {
                entry.lease_expiry = None;
                state.ready.push(entry);
            }
        }
    }

    /// Index of the next dequeueable entry: highest priority band first,
    /// FIFO within a band, visibility respected.
    fn next_visible(state: &QueueState, now: DateTime<Utc>) -> Option<usize> {
        state
            .ready
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.visible_at <= now)
            .min_by_key(|(index, entry)| (entry.priority.band(), *index))
            .map(|(index, _)| index)
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        message: &Envelope,
        options: EnqueueOptions,
    ) -> StorageResult<QueueEntry> {
        let now = self.clock.now();
        let visible_at = match options.delay {
            Some(delay) => {
                now + chrono::Duration::from_std(delay)
                    .map_err(|e| StorageError::Invalid(e.to_string()))?
            }
            None => now,
        };
        let entry = QueueEntry {
            id: MessageId::new(),
            queue_name: queue.to_string(),
            message: message.clone(),
            priority: options.priority,
            enqueued_at: now,
            visible_at,
            dequeue_count: 0,
            lease_expiry: None,
        };
        let state = self.queues.entry(queue.to_string()).or_default();
        state.lock().ready.push(entry.clone());
        Ok(entry)
    }

    async fn dequeue(&self, queue: &str) -> StorageResult<Option<QueueEntry>> {
        let Some(state) = self.queues.get(queue) else {
            return Ok(None);
        };
        let now = self.clock.now();
        let mut state = state.lock();
        Self::reclaim_expired(&mut state, now);

        let Some(index) = Self::next_visible(&state, now) else {
            return Ok(None);
        };
        let mut entry = state.ready.remove(index);
        entry.dequeue_count += 1;
        entry.lease_expiry = Some(
            now + chrono::Duration::from_std(self.lease_timeout)
                .map_err(|e| StorageError::Invalid(e.to_string()))?,
        );
        state.leased.insert(entry.id, entry.clone());
        Ok(Some(entry))
    }

    async fn peek(&self, queue: &str, count: u32) -> StorageResult<Vec<QueueEntry>> {
        let Some(state) = self.queues.get(queue) else {
            return Ok(Vec::new());
        };
        let now = self.clock.now();
        let state = state.lock();
        let mut visible: Vec<&QueueEntry> =
            state.ready.iter().filter(|entry| entry.visible_at <= now).collect();
        visible.sort_by_key(|entry| entry.priority.band());
        Ok(visible.into_iter().take(count as usize).cloned().collect())
    }

    async fn acknowledge(&self, queue: &str, entry_id: MessageId) -> StorageResult<bool> {
        let Some(state) = self.queues.get(queue) else {
            return Ok(false);
        };
        let mut state = state.lock();
        Ok(state.leased.remove(&entry_id).is_some())
    }

    async fn reject(
        &self,
        queue: &str,
        entry_id: MessageId,
        requeue: bool,
    ) -> StorageResult<bool> {
        let Some(state) = self.queues.get(queue) else {
            return Ok(false);
        };
        let mut state = state.lock();
        match state.leased.remove(&entry_id) {
            Some(mut entry) => {
                if requeue {
                    entry.lease_expiry = None;
                    state.ready.push(entry);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_queue_depth(&self, queue: &str) -> StorageResult<u64> {
        Ok(self
            .queues
            .get(queue)
            .map(|state| state.lock().ready.len() as u64)
            .unwrap_or(0))
    }

    async fn create_queue(&self, queue: &str) -> StorageResult<()> {
        self.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> StorageResult<bool> {
        Ok(self.queues.remove(queue).is_some())
    }

    async fn list_queues(&self) -> StorageResult<Vec<String>> {
        Ok(self.queues.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn queue_exists(&self, queue: &str) -> StorageResult<bool> {
        Ok(self.queues.contains_key(queue))
    }
}
