//! Shared types for the Herald messaging runtime: the message envelope,
//! persistent entry shapes for the outbox/inbox/queue/scheduler/saga
//! stores, the error taxonomy, the configuration surface, and the clock
//! abstraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;

pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use config::{HeraldConfig, IsolationLevel, QueueMode, ProducerMode, WaitStrategy};
pub use envelope::{Envelope, MessageId, MessageKind, MessagePayload};
pub use error::{ErrorKind, HeraldError, Outcome, ProcessingFailure, Result};

// ============================================================================
// Inbox
// ============================================================================

/// Lifecycle of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxStatus {
    Pending,
    Processed,
    Failed,
    Duplicate,
}

impl InboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InboxStatus::Processed | InboxStatus::Duplicate)
    }
}

/// Per-source receive options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxOptions {
    /// Logical source the message arrived from; scopes the dedupe key.
    pub source: Option<String>,
    /// Window within which a Failed entry still counts as seen.
    pub idempotency_window: Option<std::time::Duration>,
}

impl Default for InboxOptions {
    fn default() -> Self {
        Self { source: None, idempotency_window: None }
    }
}

/// One entry per received message, keyed by the source-provided
/// MessageId. For a given (source, MessageId) at most one non-Duplicate
/// entry may ever reach Processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    /// Dedupe key: the MessageId, optionally scoped by source.
    pub id: String,
    pub message: Envelope,
    pub status: InboxStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub options: InboxOptions,
}

// ============================================================================
// Outbox
// ============================================================================

/// Lifecycle of a staged outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Processed | OutboxStatus::Failed)
    }
}

/// Options applied when staging a message into the outbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboxPublishOptions {
    /// Opaque routing key handed to the dispatcher alongside the message.
    pub destination: Option<String>,
    /// Per-entry retry ceiling; the processor default applies when None.
    pub max_retries: Option<u32>,
}

/// One staged outbound message. An entry is Processing under at most one
/// claimant at a time; claims older than the lease timeout are
/// reclaimable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Server-assigned, time-ordered entry id.
    pub entry_id: u64,
    pub message: Envelope,
    pub destination: Option<String>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Queue
// ============================================================================

/// Priority band; higher drains first, FIFO within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub const BANDS: usize = 3;

    /// Band index, highest priority first.
    pub fn band(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Enqueue-time options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Defer visibility by this much from enqueue time.
    pub delay: Option<std::time::Duration>,
}

/// One queued message. Only entries with `visible_at <= now` are
/// eligible to dequeue; a dequeued entry is invisible until acked or its
/// lease expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: MessageId,
    pub queue_name: String,
    pub message: Envelope,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub dequeue_count: u32,
    pub lease_expiry: Option<DateTime<Utc>>,
}

// ============================================================================
// Dead letters
// ============================================================================

/// Context recorded when a message is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterContext {
    pub reason: String,
    /// Component that produced the failure (e.g. "outbox-processor").
    pub component: String,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminally failed message, kept for inspection. Terminal unless
/// explicitly retried or discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub dead_letter_id: MessageId,
    pub message: Envelope,
    pub reason: String,
    pub component: String,
    pub retry_count: u32,
    pub failure_time: DateTime<Utc>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

/// Aggregate view over the dead letter store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub by_component: std::collections::HashMap<String, u64>,
    pub by_reason: std::collections::HashMap<String, u64>,
}

// ============================================================================
// Scheduling
// ============================================================================

/// Lifecycle of a scheduled message. A Delivered entry is never
/// re-delivered (recurring entries re-arm as Scheduled with a new due
/// time instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleStatus {
    Scheduled,
    /// Claimed by a delivering worker; protects against double delivery.
    Delivering,
    Delivered,
    Cancelled,
    Failed,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScheduleStatus::Delivered | ScheduleStatus::Cancelled | ScheduleStatus::Failed)
    }
}

/// A message held for deferred delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: MessageId,
    pub message: Envelope,
    pub destination: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    /// Fixed re-arm interval for recurring delivery.
    pub recurrence: Option<std::time::Duration>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ============================================================================
// Idempotency
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyOutcome {
    Success,
    Failure,
}

/// Cached outcome for an idempotency key. Records past `expires_at` are
/// treated as absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub outcome: IdempotencyOutcome,
    /// Cached result for Success, failure description for Failure.
    pub result: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// ============================================================================
// Sagas
// ============================================================================

/// Application saga data. The type tag identifies the saga kind in
/// repositories and the timeout registry; `Default` supplies the data for
/// a freshly created instance.
pub trait SagaState:
    Serialize + serde::de::DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    fn saga_type() -> &'static str;
}

/// Default starting state for new saga instances.
pub const SAGA_INITIAL_STATE: &str = "Initial";

/// One saga instance. Updates must supply the current `version` and fail
/// if it has advanced; a successful update increments it by one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance<S> {
    pub correlation_id: String,
    pub current_state: String,
    pub data: S,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_completed: bool,
    pub version: u64,
    pub timeout_at: Option<DateTime<Utc>>,
}

impl<S: SagaState> SagaInstance<S> {
    pub fn new(correlation_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            current_state: SAGA_INITIAL_STATE.to_string(),
            data: S::default(),
            created_at: now,
            updated_at: now,
            is_completed: false,
            version: 0,
            timeout_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_band_order() {
        assert!(Priority::High.band() < Priority::Normal.band());
        assert!(Priority::Normal.band() < Priority::Low.band());
        assert_eq!(Priority::BANDS, 3);
    }

    #[test]
    fn statuses_terminal() {
        assert!(OutboxStatus::Processed.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
        assert!(!OutboxStatus::Processing.is_terminal());
        assert!(ScheduleStatus::Cancelled.is_terminal());
        assert!(!ScheduleStatus::Delivering.is_terminal());
        assert!(InboxStatus::Duplicate.is_terminal());
        assert!(!InboxStatus::Failed.is_terminal());
    }

    #[derive(Serialize, Deserialize, Clone, Default)]
    struct OrderSaga {
        paid: bool,
    }

    impl SagaState for OrderSaga {
        fn saga_type() -> &'static str {
            "order"
        }
    }

    #[test]
    fn new_saga_starts_at_initial_with_version_zero() {
        let saga = SagaInstance::<OrderSaga>::new("corr-1", Utc::now());
        assert_eq!(saga.current_state, SAGA_INITIAL_STATE);
        assert_eq!(saga.version, 0);
        assert!(!saga.is_completed);
    }
}
