//! Storage adapter contracts
//!
//! Every adapter (the in-memory reference implementations here, or an
//! external relational/document adapter package) implements these traits.
//! Operations are async; in Rust, caller cancellation propagates by
//! dropping the future at any await point, and long-running pipeline
//! operations additionally observe the context's cancellation token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use herald_common::{
    DeadLetterContext, DeadLetterEntry, DeadLetterStats, EnqueueOptions, Envelope, InboxEntry,
    InboxOptions, MessageId, MessageKind, OutboxEntry, OutboxPublishOptions, QueueEntry,
    SagaInstance, SagaState, ScheduledMessage,
};

use crate::error::StorageResult;

/// Filter for [`MessageStore::query`] and [`MessageStore::count`].
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub message_type: Option<String>,
    pub kind: Option<MessageKind>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Options applied when storing a raw message.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Remove the message automatically after this long.
    pub ttl: Option<Duration>,
}

/// General-purpose message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store(&self, message: &Envelope, options: StoreOptions) -> StorageResult<MessageId>;
    async fn retrieve(&self, id: MessageId) -> StorageResult<Option<Envelope>>;
    async fn delete(&self, id: MessageId) -> StorageResult<bool>;
    async fn exists(&self, id: MessageId) -> StorageResult<bool>;
    async fn query(&self, filter: MessageFilter) -> StorageResult<Vec<Envelope>>;
    async fn update(&self, id: MessageId, message: &Envelope) -> StorageResult<bool>;
    async fn count(&self, filter: Option<MessageFilter>) -> StorageResult<u64>;
    async fn clear(&self) -> StorageResult<()>;
}

/// Staged outbound messages. An entry is Processing under at most one
/// claimant; claims older than the lease timeout are reclaimable.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn add(
        &self,
        message: &Envelope,
        options: OutboxPublishOptions,
    ) -> StorageResult<OutboxEntry>;

    /// Non-claiming read of Pending entries whose retry time has come.
    async fn get_pending(&self, limit: u32) -> StorageResult<Vec<OutboxEntry>>;

    /// Atomically transition up to `limit` due Pending entries to
    /// Processing, recording the claimant and claim time.
    async fn claim_pending(
        &self,
        limit: u32,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<OutboxEntry>>;

    async fn mark_processed(&self, entry_id: u64) -> StorageResult<bool>;
    async fn mark_failed(&self, entry_id: u64, error: &str) -> StorageResult<bool>;

    /// Record a retry attempt: bump the count, set the next attempt time,
    /// and return the entry to Pending.
    async fn update_retry(
        &self,
        entry_id: u64,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StorageResult<bool>;

    async fn get_pending_count(&self) -> StorageResult<u64>;
    async fn get_failed(&self, limit: u32) -> StorageResult<Vec<OutboxEntry>>;

    /// Return Processing entries whose claim is older than `lease` to
    /// Pending. Returns the number of reclaimed entries.
    async fn reclaim_expired(&self, lease: Duration, now: DateTime<Utc>) -> StorageResult<u64>;
}

/// Received-message dedupe log.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Insert a Pending entry for this message. Returns None when a
    /// live entry with the same dedupe key already exists (the caller
    /// treats the message as a duplicate). A Failed entry past the
    /// idempotency window no longer blocks the key: it is replaced by a
    /// fresh Pending entry and the insert succeeds.
    async fn add(
        &self,
        dedupe_key: &str,
        message: &Envelope,
        options: InboxOptions,
    ) -> StorageResult<Option<InboxEntry>>;

    /// Whether a prior entry blocks re-processing: Processed entries
    /// always do; Failed entries only within `window` of receipt.
    async fn is_duplicate(&self, dedupe_key: &str, window: Option<Duration>)
        -> StorageResult<bool>;

    async fn get(&self, dedupe_key: &str) -> StorageResult<Option<InboxEntry>>;
    async fn mark_processed(&self, dedupe_key: &str) -> StorageResult<bool>;
    async fn mark_failed(&self, dedupe_key: &str, error: &str) -> StorageResult<bool>;
    async fn get_unprocessed(&self, limit: u32) -> StorageResult<Vec<InboxEntry>>;
    async fn get_unprocessed_count(&self) -> StorageResult<u64>;

    /// Purge Processed entries older than `older_than`. Returns the
    /// number removed.
    async fn cleanup_old_entries(&self, older_than: DateTime<Utc>) -> StorageResult<u64>;
}

/// Durable named queues with visibility and lease semantics.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        message: &Envelope,
        options: EnqueueOptions,
    ) -> StorageResult<QueueEntry>;

    /// Take the next visible entry, starting its lease. Returns None when
    /// nothing is currently visible.
    async fn dequeue(&self, queue: &str) -> StorageResult<Option<QueueEntry>>;

    async fn peek(&self, queue: &str, count: u32) -> StorageResult<Vec<QueueEntry>>;
    async fn acknowledge(&self, queue: &str, entry_id: MessageId) -> StorageResult<bool>;

    /// Reject a leased entry; re-queue it for redelivery when `requeue`
    /// is set, otherwise drop it.
    async fn reject(&self, queue: &str, entry_id: MessageId, requeue: bool)
        -> StorageResult<bool>;

    async fn get_queue_depth(&self, queue: &str) -> StorageResult<u64>;
    async fn create_queue(&self, queue: &str) -> StorageResult<()>;
    async fn delete_queue(&self, queue: &str) -> StorageResult<bool>;
    async fn list_queues(&self) -> StorageResult<Vec<String>>;
    async fn queue_exists(&self, queue: &str) -> StorageResult<bool>;
}

/// Terminally failed messages kept for inspection.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn send_to_dead_letter(
        &self,
        message: &Envelope,
        context: DeadLetterContext,
    ) -> StorageResult<MessageId>;

    async fn get_dead_letters(&self, limit: u32) -> StorageResult<Vec<DeadLetterEntry>>;

    /// Take an entry out of the store for re-staging. Returns the entry,
    /// or None if it was not present.
    async fn retry(&self, dead_letter_id: MessageId) -> StorageResult<Option<DeadLetterEntry>>;

    async fn discard(&self, dead_letter_id: MessageId) -> StorageResult<bool>;
    async fn count(&self) -> StorageResult<u64>;
    async fn statistics(&self) -> StorageResult<DeadLetterStats>;
}

/// Saga persistence with optimistic concurrency.
#[async_trait]
pub trait SagaRepository<S: SagaState>: Send + Sync {
    async fn load(&self, correlation_id: &str) -> StorageResult<Option<SagaInstance<S>>>;

    /// Persist `saga` only if the stored version still equals
    /// `expected_version` (0 means "must not exist yet"). On success the
    /// stored version becomes `expected_version + 1`. Returns false when
    /// another writer advanced the version first.
    async fn save(&self, saga: &SagaInstance<S>, expected_version: u64) -> StorageResult<bool>;

    /// Incomplete sagas whose `timeout_at` has passed.
    async fn get_expired(&self, now: DateTime<Utc>) -> StorageResult<Vec<SagaInstance<S>>>;
}

/// Deferred-delivery persistence for the storage-backed scheduler.
#[async_trait]
pub trait ScheduledMessageStore: Send + Sync {
    async fn add(&self, scheduled: &ScheduledMessage) -> StorageResult<()>;
    async fn get(&self, id: MessageId) -> StorageResult<Option<ScheduledMessage>>;

    /// Atomically claim entries due within `look_ahead` of `now`
    /// (Scheduled -> Delivering, recording the claim time).
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        look_ahead: Duration,
        limit: u32,
    ) -> StorageResult<Vec<ScheduledMessage>>;

    async fn mark_delivered(&self, id: MessageId) -> StorageResult<bool>;
    async fn mark_failed(&self, id: MessageId, error: &str) -> StorageResult<bool>;

    /// Cancel a Scheduled entry. Advisory: an entry already claimed for
    /// delivery may still be delivered.
    async fn cancel(&self, id: MessageId) -> StorageResult<bool>;

    /// Re-arm a delivered recurring entry for its next occurrence.
    async fn reschedule(&self, id: MessageId, next: DateTime<Utc>) -> StorageResult<bool>;

    /// Return Delivering entries whose claim is older than `claim_timeout`
    /// to Scheduled.
    async fn reclaim_expired(
        &self,
        claim_timeout: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<u64>;

    async fn get_due_count(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}
