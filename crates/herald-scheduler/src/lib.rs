//! Delayed-delivery engine
//!
//! One contract, two implementations: an in-memory timer wheel driven by
//! a single dispatcher task that waits on the earliest deadline, and a
//! storage-polled variant that claims due entries from a
//! [`herald_storage::ScheduledMessageStore`]. Cancellation is advisory:
//! an entry already claimed for delivery may still be delivered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use herald_common::{Envelope, HeraldError, MessageId, ScheduledMessage};

pub mod memory;
pub mod polling;

pub use memory::InMemoryScheduler;
pub use polling::PollingScheduler;

/// Options applied when scheduling a message.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Fixed interval for recurring delivery; the entry is re-armed
    /// after each successful delivery.
    pub recurrence: Option<Duration>,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register `message` for delivery to `destination` at `when`. A
    /// time in the past delivers immediately.
    async fn schedule(
        &self,
        message: Envelope,
        destination: &str,
        when: DateTime<Utc>,
        options: ScheduleOptions,
    ) -> Result<MessageId, HeraldError>;

    /// Advisory cancel by id; returns false when the entry is unknown or
    /// already past the point of no return.
    async fn cancel(&self, id: MessageId) -> Result<bool, HeraldError>;
}

/// Receives due messages from a scheduler.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, scheduled: &ScheduledMessage) -> Result<(), HeraldError>;
}

/// Closure-backed delivery handler.
pub struct FnDeliveryHandler<F>(pub F);

#[async_trait]
impl<F, Fut> DeliveryHandler for FnDeliveryHandler<F>
where
    F: Fn(ScheduledMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HeraldError>> + Send,
{
    async fn deliver(&self, scheduled: &ScheduledMessage) -> Result<(), HeraldError> {
        (self.0)(scheduled.clone()).await
    }
}
