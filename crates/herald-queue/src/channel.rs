//! Channel-style queue
//!
//! A bounded or unbounded FIFO with backpressure: enqueue suspends when
//! the queue is full (unless configured to evict the oldest item), and
//! dequeue suspends until an item is visible or the queue closes.
//! Priority bands drain highest first; deferred items and expired leases
//! are folded back in on every dequeue pass.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use herald_common::Priority;

use crate::error::{QueueError, Result};
use crate::{LeasedItem, MessageQueue, QueueItem};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ChannelQueueConfig {
    /// None means unbounded.
    pub capacity: Option<usize>,
    /// Evict the oldest queued item instead of suspending the producer.
    pub drop_when_full: bool,
    pub lease_timeout: Duration,
}

impl Default for ChannelQueueConfig {
    fn default() -> Self {
        Self { capacity: None, drop_when_full: false, lease_timeout: DEFAULT_LEASE }
    }
}

struct ReadyItem {
    seq: u64,
    item: QueueItem,
    dequeue_count: u32,
}

struct DeferredItem {
    due: Instant,
    seq: u64,
    item: QueueItem,
    dequeue_count: u32,
}

struct LeasedRecord {
    item: QueueItem,
    dequeue_count: u32,
    expires: Instant,
}

#[derive(Default)]
struct ChannelState {
    bands: [VecDeque<ReadyItem>; Priority::BANDS],
    /// Min-heap on due time; payloads keyed by seq.
    deferred_order: BinaryHeap<Reverse<(Instant, u64)>>,
    deferred: HashMap<u64, DeferredItem>,
    leased: HashMap<u64, LeasedRecord>,
}

impl ChannelState {
    fn observable(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum::<usize>() + self.deferred.len()
    }

    /// Move due deferred items into their bands.
    fn release_due(&mut self, now: Instant) {
        while let Some(Reverse((due, seq))) = self.deferred_order.peek().copied() {
            if due > now {
                break;
            }
            self.deferred_order.pop();
            if let Some(deferred) = self.deferred.remove(&seq) {
                self.bands[deferred.item.priority.band()].push_back(ReadyItem {
                    seq: deferred.seq,
                    item: deferred.item,
                    dequeue_count: deferred.dequeue_count,
                });
            }
        }
    }

    /// Fold expired leases back into their bands.
    fn reclaim_leases(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, record)| record.expires <= now)
            .map(|(lease, _)| *lease)
            .collect();
        for lease in expired {
            if let Some(record) = self.leased.remove(&lease) {
                self.bands[record.item.priority.band()].push_back(ReadyItem {
                    seq: lease,
                    item: record.item,
                    dequeue_count: record.dequeue_count,
                });
            }
        }
    }

    fn pop_ready(&mut self) -> Option<ReadyItem> {
        self.bands.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Next instant at which held-back work becomes available.
    fn next_wake(&self) -> Option<Instant> {
        let deferred = self.deferred_order.peek().map(|Reverse((due, _))| *due);
        let lease = self.leased.values().map(|record| record.expires).min();
        match (deferred, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Evict the oldest observable item (smallest seq across bands and
    /// the deferred set).
    fn evict_oldest(&mut self) {
        let ready_oldest = self
            .bands
            .iter()
            .enumerate()
            .filter_map(|(band, items)| items.front().map(|item| (item.seq, band)))
            .min();
        let deferred_oldest = self.deferred.keys().min().copied();

        // A deferred entry removed here leaves a stale heap key behind;
        // release_due skips keys with no payload.
        match (ready_oldest, deferred_oldest) {
            (Some((ready_seq, _)), Some(deferred_seq)) if deferred_seq < ready_seq => {
                self.deferred.remove(&deferred_seq);
            }
            (Some((_, band)), _) => {
                self.bands[band].pop_front();
            }
            (None, Some(deferred_seq)) => {
                self.deferred.remove(&deferred_seq);
            }
            (None, None) => {}
        }
    }
}

pub struct ChannelQueue {
    config: ChannelQueueConfig,
    state: Mutex<ChannelState>,
    seq: AtomicU64,
    closed: AtomicBool,
    /// Signalled when an item becomes available to consumers.
    consumer_notify: Notify,
    /// Signalled when capacity frees up for suspended producers.
    producer_notify: Notify,
}

impl ChannelQueue {
    pub fn new(config: ChannelQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ChannelState::default()),
            seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            consumer_notify: Notify::new(),
            producer_notify: Notify::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(ChannelQueueConfig::default())
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::new(ChannelQueueConfig { capacity: Some(capacity), ..Default::default() })
    }

    fn admit(&self, item: QueueItem, dequeue_count: u32) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        match item.visible_at {
            Some(due) if due > Instant::now() => {
                state.deferred_order.push(Reverse((due, seq)));
                state.deferred.insert(seq, DeferredItem { due, seq, item, dequeue_count });
            }
            _ => {
                state.bands[item.priority.band()].push_back(ReadyItem {
                    seq,
                    item,
                    dequeue_count,
                });
            }
        }
        drop(state);
        self.consumer_notify.notify_one();
    }
}

#[async_trait]
impl MessageQueue for ChannelQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            let must_wait = if let Some(capacity) = self.config.capacity {
                let mut state = self.state.lock();
                if state.observable() >= capacity {
                    if self.config.drop_when_full {
                        debug!("Channel queue full, evicting oldest item");
                        state.evict_oldest();
                        false
                    } else {
                        // Suspend until a consumer frees capacity.
                        true
                    }
                } else {
                    false
                }
            } else {
                false
            };
            if must_wait {
                self.producer_notify.notified().await;
                continue;
            }
            self.admit(item, 0);
            return Ok(());
        }
    }

    async fn dequeue(&self) -> Result<Option<LeasedItem>> {
        loop {
            let wake_at = {
                let now = Instant::now();
                let mut state = self.state.lock();
                state.release_due(now);
                state.reclaim_leases(now);

                if let Some(ready) = state.pop_ready() {
                    let lease_id = ready.seq;
                    let dequeue_count = ready.dequeue_count + 1;
                    state.leased.insert(
                        lease_id,
                        LeasedRecord {
                            item: ready.item.clone(),
                            dequeue_count,
                            expires: now + self.config.lease_timeout,
                        },
                    );
                    drop(state);
                    self.producer_notify.notify_one();
                    return Ok(Some(LeasedItem { lease_id, item: ready.item, dequeue_count }));
                }

                if self.closed.load(Ordering::SeqCst) && state.observable() == 0 {
                    return Ok(None);
                }
                state.next_wake()
            };

            match wake_at {
                Some(due) => {
                    let wait = due.saturating_duration_since(Instant::now());
                    tokio::select! {
                        _ = self.consumer_notify.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => self.consumer_notify.notified().await,
            }
        }
    }

    async fn ack(&self, lease_id: u64) -> Result<bool> {
        let removed = self.state.lock().leased.remove(&lease_id).is_some();
        if removed {
            self.producer_notify.notify_one();
        }
        Ok(removed)
    }

    async fn nack(&self, lease_id: u64, delay: Option<Duration>) -> Result<bool> {
        let record = self.state.lock().leased.remove(&lease_id);
        match record {
            Some(record) => {
                let mut item = record.item;
                item.visible_at = delay.map(|delay| Instant::now() + delay);
                self.admit(item, record.dequeue_count);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn depth(&self) -> usize {
        self.state.lock().observable()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.consumer_notify.notify_waiters();
        self.producer_notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
