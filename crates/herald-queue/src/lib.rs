//! In-memory queue transport
//!
//! Two interchangeable implementations behind one contract: a
//! channel-style queue (async, backpressured) and a ring-buffer queue
//! (pre-allocated sequenced slots). Both honour priority bands, deferred
//! visibility, and at-most-once delivery per lease: a dequeued item is
//! invisible until acked or its lease expires.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use herald_common::{Envelope, Priority};

pub mod channel;
pub mod error;
pub mod ring;

pub use channel::ChannelQueue;
pub use error::{QueueError, Result};
pub use ring::{RingBuffer, RingQueue};

/// One item handed to the transport.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub envelope: Envelope,
    pub priority: Priority,
    /// Items with a future visibility instant are held back until due.
    pub visible_at: Option<Instant>,
}

impl QueueItem {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope, priority: Priority::Normal, visible_at: None }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.visible_at = Some(Instant::now() + delay);
        self
    }
}

/// A dequeued item and its lease. Dropping the lease without acking
/// leaves the item invisible until the lease times out.
#[derive(Debug)]
pub struct LeasedItem {
    pub lease_id: u64,
    pub item: QueueItem,
    pub dequeue_count: u32,
}

/// Contract both queue backends satisfy.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Add an item. Suspends while the queue is at capacity unless the
    /// queue was configured to drop its oldest item instead.
    async fn enqueue(&self, item: QueueItem) -> Result<()>;

    /// Take the next visible item, highest priority band first, FIFO
    /// within a band. Suspends until an item is available; returns None
    /// once the queue is closed and drained.
    async fn dequeue(&self) -> Result<Option<LeasedItem>>;

    /// Remove a leased item for good.
    async fn ack(&self, lease_id: u64) -> Result<bool>;

    /// Return a leased item to the queue, optionally deferring its
    /// visibility.
    async fn nack(&self, lease_id: u64, delay: Option<Duration>) -> Result<bool>;

    /// Items currently observable by dequeue (ready + deferred, not
    /// leased).
    fn depth(&self) -> usize;

    /// Stop accepting items; consumers drain what remains.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
