//! Resilient storage wrappers
//!
//! Decorators implementing the storage contracts by delegating to an
//! inner adapter under a [`ConnectionResilience`] policy. Resilience
//! stays orthogonal to adapter logic: an adapter maps its native errors
//! onto [`crate::StorageError`] and these wrappers decide what to do
//! about the transient ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use herald_common::{Envelope, InboxEntry, InboxOptions, MessageId, OutboxEntry, OutboxPublishOptions, ScheduledMessage};

use crate::contracts::{InboxStore, OutboxStore, ScheduledMessageStore};
use crate::error::StorageResult;
use crate::resilience::ConnectionResilience;

/// [`OutboxStore`] decorator running every operation under the policy.
pub struct ResilientOutboxStore<S> {
    inner: Arc<S>,
    policy: Arc<ConnectionResilience>,
}

impl<S: OutboxStore> ResilientOutboxStore<S> {
    pub fn new(inner: Arc<S>, policy: Arc<ConnectionResilience>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: OutboxStore> OutboxStore for ResilientOutboxStore<S> {
    async fn add(
        &self,
        message: &Envelope,
        options: OutboxPublishOptions,
    ) -> StorageResult<OutboxEntry> {
        self.policy.execute(|| self.inner.add(message, options.clone())).await
    }

    async fn get_pending(&self, limit: u32) -> StorageResult<Vec<OutboxEntry>> {
        self.policy.execute(|| self.inner.get_pending(limit)).await
    }

    async fn claim_pending(
        &self,
        limit: u32,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<OutboxEntry>> {
        self.policy.execute(|| self.inner.claim_pending(limit, claimant, now)).await
    }

    async fn mark_processed(&self, entry_id: u64) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.mark_processed(entry_id)).await
    }

    async fn mark_failed(&self, entry_id: u64, error: &str) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.mark_failed(entry_id, error)).await
    }

    async fn update_retry(
        &self,
        entry_id: u64,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StorageResult<bool> {
        self.policy
            .execute(|| self.inner.update_retry(entry_id, retry_count, next_retry_at))
            .await
    }

    async fn get_pending_count(&self) -> StorageResult<u64> {
        self.policy.execute(|| self.inner.get_pending_count()).await
    }

    async fn get_failed(&self, limit: u32) -> StorageResult<Vec<OutboxEntry>> {
        self.policy.execute(|| self.inner.get_failed(limit)).await
    }

    async fn reclaim_expired(&self, lease: Duration, now: DateTime<Utc>) -> StorageResult<u64> {
        self.policy.execute(|| self.inner.reclaim_expired(lease, now)).await
    }
}

/// [`InboxStore`] decorator running every operation under the policy.
pub struct ResilientInboxStore<S> {
    inner: Arc<S>,
    policy: Arc<ConnectionResilience>,
}

impl<S: InboxStore> ResilientInboxStore<S> {
    pub fn new(inner: Arc<S>, policy: Arc<ConnectionResilience>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: InboxStore> InboxStore for ResilientInboxStore<S> {
    async fn add(
        &self,
        dedupe_key: &str,
        message: &Envelope,
        options: InboxOptions,
    ) -> StorageResult<Option<InboxEntry>> {
        self.policy.execute(|| self.inner.add(dedupe_key, message, options.clone())).await
    }

    async fn is_duplicate(
        &self,
        dedupe_key: &str,
        window: Option<Duration>,
    ) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.is_duplicate(dedupe_key, window)).await
    }

    async fn get(&self, dedupe_key: &str) -> StorageResult<Option<InboxEntry>> {
        self.policy.execute(|| self.inner.get(dedupe_key)).await
    }

    async fn mark_processed(&self, dedupe_key: &str) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.mark_processed(dedupe_key)).await
    }

    async fn mark_failed(&self, dedupe_key: &str, error: &str) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.mark_failed(dedupe_key, error)).await
    }

    async fn get_unprocessed(&self, limit: u32) -> StorageResult<Vec<InboxEntry>> {
        self.policy.execute(|| self.inner.get_unprocessed(limit)).await
    }

    async fn get_unprocessed_count(&self) -> StorageResult<u64> {
        self.policy.execute(|| self.inner.get_unprocessed_count()).await
    }

    async fn cleanup_old_entries(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        self.policy.execute(|| self.inner.cleanup_old_entries(older_than)).await
    }
}

/// [`ScheduledMessageStore`] decorator running every operation under the
/// policy.
pub struct ResilientScheduledMessageStore<S> {
    inner: Arc<S>,
    policy: Arc<ConnectionResilience>,
}

impl<S: ScheduledMessageStore> ResilientScheduledMessageStore<S> {
    pub fn new(inner: Arc<S>, policy: Arc<ConnectionResilience>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: ScheduledMessageStore> ScheduledMessageStore for ResilientScheduledMessageStore<S> {
    async fn add(&self, scheduled: &ScheduledMessage) -> StorageResult<()> {
        self.policy.execute(|| self.inner.add(scheduled)).await
    }

    async fn get(&self, id: MessageId) -> StorageResult<Option<ScheduledMessage>> {
        self.policy.execute(|| self.inner.get(id)).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        look_ahead: Duration,
        limit: u32,
    ) -> StorageResult<Vec<ScheduledMessage>> {
        self.policy.execute(|| self.inner.claim_due(now, look_ahead, limit)).await
    }

    async fn mark_delivered(&self, id: MessageId) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.mark_delivered(id)).await
    }

    async fn mark_failed(&self, id: MessageId, error: &str) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.mark_failed(id, error)).await
    }

    async fn cancel(&self, id: MessageId) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.cancel(id)).await
    }

    async fn reschedule(&self, id: MessageId, next: DateTime<Utc>) -> StorageResult<bool> {
        self.policy.execute(|| self.inner.reschedule(id, next)).await
    }

    async fn reclaim_expired(
        &self,
        claim_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<u64> {
        self.policy.execute(|| self.inner.reclaim_expired(claim_timeout, now)).await
    }

    async fn get_due_count(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        self.policy.execute(|| self.inner.get_due_count(now)).await
    }
}
