//! Ring-buffer queue
//!
//! A power-of-two-sized slot array published and consumed through
//! per-slot sequence numbers: a producer claims a sequence by advancing
//! the producer cursor (CAS-free fetch_add in multi-producer mode, plain
//! store in single-producer mode), writes the slot, and releases it by
//! bumping the slot sequence; the consumer reads a slot only once its
//! sequence matches the expected value and frees it for the next lap.
//! Release/acquire ordering on the slot sequence is the happens-before
//! edge between publish and consume.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use herald_common::{ProducerMode, WaitStrategy};

use crate::error::{QueueError, Result};
use crate::{LeasedItem, MessageQueue, QueueItem};

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 128;

struct Slot<T> {
    sequence: AtomicU64,
    value: Mutex<Option<T>>,
}

/// Sequenced single-consumer ring. Multi-producer support comes from the
/// atomically claimed producer cursor; the consumer side is owned by one
/// task at a time (the queue serialises consumers with a cursor lock).
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    capacity: u64,
    /// Next sequence a producer claims.
    producer_cursor: AtomicU64,
    /// Next sequence the consumer reads.
    consumer_cursor: AtomicU64,
    producer_mode: ProducerMode,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize, producer_mode: ProducerMode) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QueueError::Configuration(format!(
                "ring buffer size must be a power of two, got {}",
                capacity
            )));
        }
        let slots: Box<[Slot<T>]> = (0..capacity as u64)
            .map(|index| Slot { sequence: AtomicU64::new(index), value: Mutex::new(None) })
            .collect();
        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            producer_cursor: AtomicU64::new(0),
            consumer_cursor: AtomicU64::new(0),
            producer_mode,
        })
    }

    fn slot(&self, sequence: u64) -> &Slot<T> {
        &self.slots[(sequence & self.mask) as usize]
    }

    /// Claim-and-publish without waiting. Returns the value back when
    /// the buffer is full.
    pub fn try_push(&self, value: T) -> std::result::Result<(), T> {
        let sequence = match self.producer_mode {
            ProducerMode::Multi => {
                // Claim by advancing the cursor only when the target slot
                // is free for this lap.
                loop {
                    let sequence = self.producer_cursor.load(Ordering::Acquire);
                    if self.slot(sequence).sequence.load(Ordering::Acquire) != sequence {
                        return Err(value);
                    }
                    if self
                        .producer_cursor
                        .compare_exchange_weak(
                            sequence,
                            sequence + 1,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        break sequence;
                    }
                }
            }
            ProducerMode::Single => {
                let sequence = self.producer_cursor.load(Ordering::Relaxed);
                if self.slot(sequence).sequence.load(Ordering::Acquire) != sequence {
                    return Err(value);
                }
                self.producer_cursor.store(sequence + 1, Ordering::Relaxed);
                sequence
            }
        };

        let slot = self.slot(sequence);
        *slot.value.lock() = Some(value);
        // Publish: consumers read the slot once its sequence is seq + 1.
        slot.sequence.store(sequence + 1, Ordering::Release);
        Ok(())
    }

    /// Consume the next published value, if any.
    pub fn try_pop(&self) -> Option<T> {
        let sequence = self.consumer_cursor.load(Ordering::Relaxed);
        let slot = self.slot(sequence);
        if slot.sequence.load(Ordering::Acquire) != sequence + 1 {
            return None;
        }
        let value = slot.value.lock().take();
        // Free the slot for the producer's next lap.
        slot.sequence.store(sequence + self.capacity, Ordering::Release);
        self.consumer_cursor.store(sequence + 1, Ordering::Relaxed);
        value
    }

    pub fn len(&self) -> usize {
        let produced = self.producer_cursor.load(Ordering::Acquire);
        let consumed = self.consumer_cursor.load(Ordering::Acquire);
        produced.saturating_sub(consumed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

#[derive(Debug, Clone)]
pub struct RingQueueConfig {
    /// Slot count per priority band; must be a power of two.
    pub buffer_size: usize,
    pub wait_strategy: WaitStrategy,
    pub producer_mode: ProducerMode,
    pub lease_timeout: Duration,
}

impl Default for RingQueueConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            wait_strategy: WaitStrategy::Sleeping,
            producer_mode: ProducerMode::Multi,
            lease_timeout: Duration::from_secs(30),
        }
    }
}

struct DeferredEntry {
    item: QueueItem,
    dequeue_count: u32,
}

#[derive(Default)]
struct SideState {
    deferred_order: BinaryHeap<Reverse<(Instant, u64)>>,
    deferred: HashMap<u64, DeferredEntry>,
    leased: HashMap<u64, (QueueItem, u32, Instant)>,
}

/// The ring-backed transport: one ring per priority band, highest band
/// drained first, plus the same deferred-visibility and lease tracking
/// the channel queue has (those paths are off the hot ring path and use
/// a plain mutex).
pub struct RingQueue {
    bands: Vec<RingBuffer<(QueueItem, u32)>>,
    config: RingQueueConfig,
    side: Mutex<SideState>,
    seq: AtomicU64,
    closed: AtomicBool,
    /// Used by the Blocking wait strategy.
    published: Notify,
    /// Serialises consumers; the per-band rings are single-consumer.
    consumer_gate: tokio::sync::Mutex<()>,
}

impl RingQueue {
    pub fn new(config: RingQueueConfig) -> Result<Self> {
        let bands = (0..herald_common::Priority::BANDS)
            .map(|_| RingBuffer::new(config.buffer_size, config.producer_mode))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            bands,
            config,
            side: Mutex::new(SideState::default()),
            seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            published: Notify::new(),
            consumer_gate: tokio::sync::Mutex::new(()),
        })
    }

    fn release_due(&self) {
        let now = Instant::now();
        let mut side = self.side.lock();
        loop {
            let due_seq = match side.deferred_order.peek() {
                Some(Reverse((due, seq))) if *due <= now => *seq,
                _ => break,
            };
            side.deferred_order.pop();
            if let Some(entry) = side.deferred.remove(&due_seq) {
                let band = entry.item.priority.band();
                // A full ring pushes the entry back out as deferred-now;
                // it will be retried on the next pass.
                if let Err((item, count)) = self.bands[band].try_push((entry.item, entry.dequeue_count)) {
                    side.deferred_order.push(Reverse((now, due_seq)));
                    side.deferred.insert(due_seq, DeferredEntry { item, dequeue_count: count });
                    break;
                }
            }
        }

        let expired: Vec<u64> = side
            .leased
            .iter()
            .filter(|(_, (_, _, expires))| *expires <= now)
            .map(|(lease, _)| *lease)
            .collect();
        for lease in expired {
            if let Some((item, count, _)) = side.leased.remove(&lease) {
                let band = item.priority.band();
                if let Err((item, count)) = self.bands[band].try_push((item, count)) {
                    side.leased.insert(lease, (item, count, now));
                    break;
                }
            }
        }
    }

    fn try_take(&self) -> Option<(QueueItem, u32)> {
        self.release_due();
        self.bands.iter().find_map(RingBuffer::try_pop)
    }

    /// One round of the configured consumer wait.
    async fn wait_round(&self, round: u32) {
        match self.config.wait_strategy {
            WaitStrategy::BusySpin => {
                std::hint::spin_loop();
            }
            WaitStrategy::Yielding => {
                if round < SPIN_LIMIT {
                    std::hint::spin_loop();
                } else {
                    tokio::task::yield_now().await;
                }
            }
            WaitStrategy::Sleeping => {
                if round < SPIN_LIMIT {
                    std::hint::spin_loop();
                } else if round < YIELD_LIMIT {
                    tokio::task::yield_now().await;
                } else {
                    let step = (round - YIELD_LIMIT).min(20) as u64;
                    tokio::time::sleep(Duration::from_micros(50 * (step + 1))).await;
                }
            }
            WaitStrategy::Blocking => {
                tokio::select! {
                    _ = self.published.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }
    }
}

#[async_trait]
impl MessageQueue for RingQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        if let Some(due) = item.visible_at {
            if due > Instant::now() {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                let mut side = self.side.lock();
                side.deferred_order.push(Reverse((due, seq)));
                side.deferred.insert(seq, DeferredEntry { item, dequeue_count: 0 });
                return Ok(());
            }
        }

        let band = item.priority.band();
        let mut value = (item, 0u32);
        let mut round = 0;
        loop {
            match self.bands[band].try_push(value) {
                Ok(()) => {
                    self.published.notify_one();
                    return Ok(());
                }
                Err(returned) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(QueueError::Closed);
                    }
                    value = returned;
                    // Producer backpressure: yield until the consumer
                    // frees a slot.
                    tokio::task::yield_now().await;
                    round += 1;
                    if round > YIELD_LIMIT {
                        tokio::time::sleep(Duration::from_micros(100)).await;
                    }
                }
            }
        }
    }

    async fn dequeue(&self) -> Result<Option<LeasedItem>> {
        let _gate = self.consumer_gate.lock().await;
        let mut round = 0;
        loop {
            if let Some((item, prior_count)) = self.try_take() {
                let lease_id = self.seq.fetch_add(1, Ordering::Relaxed);
                let dequeue_count = prior_count + 1;
                self.side.lock().leased.insert(
                    lease_id,
                    (item.clone(), dequeue_count, Instant::now() + self.config.lease_timeout),
                );
                return Ok(Some(LeasedItem { lease_id, item, dequeue_count }));
            }
            if self.closed.load(Ordering::SeqCst) && self.depth() == 0 {
                return Ok(None);
            }
            self.wait_round(round).await;
            round = round.wrapping_add(1);
        }
    }

    async fn ack(&self, lease_id: u64) -> Result<bool> {
        Ok(self.side.lock().leased.remove(&lease_id).is_some())
    }

    async fn nack(&self, lease_id: u64, delay: Option<Duration>) -> Result<bool> {
        let taken = self.side.lock().leased.remove(&lease_id);
        let Some((mut item, count, _)) = taken else {
            return Ok(false);
        };
        match delay {
            Some(delay) => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                let due = Instant::now() + delay;
                let mut side = self.side.lock();
                side.deferred_order.push(Reverse((due, seq)));
                item.visible_at = Some(due);
                side.deferred.insert(seq, DeferredEntry { item, dequeue_count: count });
            }
            None => {
                let band = item.priority.band();
                let mut value = (item, count);
                loop {
                    match self.bands[band].try_push(value) {
                        Ok(()) => break,
                        Err(returned) => {
                            value = returned;
                            tokio::task::yield_now().await;
                        }
                    }
                }
                self.published.notify_one();
            }
        }
        Ok(true)
    }

    fn depth(&self) -> usize {
        let rings: usize = self.bands.iter().map(RingBuffer::len).sum();
        rings + self.side.lock().deferred.len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.published.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::{Envelope, MessageId, MessageKind, Priority};
    use std::sync::Arc;

    fn item(n: u32) -> QueueItem {
        QueueItem::new(Envelope::from_parts(
            MessageId::new(),
            MessageKind::Command,
            "work",
            serde_json::json!({ "n": n }),
        ))
    }

    fn payload_n(leased: &LeasedItem) -> u64 {
        leased.item.envelope.payload["n"].as_u64().unwrap()
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(
            RingBuffer::<u32>::new(1000, ProducerMode::Single),
            Err(QueueError::Configuration(_))
        ));
        assert!(RingBuffer::<u32>::new(1024, ProducerMode::Single).is_ok());
        assert!(matches!(
            RingQueue::new(RingQueueConfig { buffer_size: 6, ..Default::default() }),
            Err(QueueError::Configuration(_))
        ));
    }

    #[test]
    fn push_pop_wraps_around() {
        let ring = RingBuffer::new(4, ProducerMode::Single).unwrap();
        for lap in 0..3 {
            for n in 0..4 {
                ring.try_push(lap * 4 + n).unwrap();
            }
            assert!(ring.try_push(99).is_err());
            for n in 0..4 {
                assert_eq!(ring.try_pop(), Some(lap * 4 + n));
            }
            assert_eq!(ring.try_pop(), None);
        }
    }

    #[tokio::test]
    async fn single_producer_single_consumer_preserves_order() {
        // Buffer smaller than the item count forces wrap-around and
        // producer backpressure.
        let queue = Arc::new(
            RingQueue::new(RingQueueConfig {
                buffer_size: 8,
                producer_mode: ProducerMode::Single,
                wait_strategy: WaitStrategy::Yielding,
                ..Default::default()
            })
            .unwrap(),
        );

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for n in 1..=100 {
                    queue.enqueue(item(n)).await.unwrap();
                }
            })
        };

        let mut seen = Vec::with_capacity(100);
        while seen.len() < 100 {
            let leased = queue.dequeue().await.unwrap().unwrap();
            seen.push(payload_n(&leased));
            queue.ack(leased.lease_id).await.unwrap();
        }
        producer.await.unwrap();

        let expected: Vec<u64> = (1..=100).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn multi_producer_delivers_everything() {
        let queue = Arc::new(
            RingQueue::new(RingQueueConfig {
                buffer_size: 16,
                producer_mode: ProducerMode::Multi,
                wait_strategy: WaitStrategy::Blocking,
                ..Default::default()
            })
            .unwrap(),
        );

        let mut producers = Vec::new();
        for p in 0..4u32 {
            let queue = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                for n in 0..25u32 {
                    queue.enqueue(item(p * 100 + n)).await.unwrap();
                }
            }));
        }

        let mut seen = std::collections::HashSet::new();
        while seen.len() < 100 {
            let leased = queue.dequeue().await.unwrap().unwrap();
            seen.insert(payload_n(&leased));
            queue.ack(leased.lease_id).await.unwrap();
        }
        for producer in producers {
            producer.await.unwrap();
        }
        assert_eq!(seen.len(), 100);
    }

    #[tokio::test]
    async fn higher_band_drains_first() {
        let queue = RingQueue::new(RingQueueConfig::default()).unwrap();
        queue.enqueue(item(1)).await.unwrap();
        queue.enqueue(item(2).with_priority(Priority::High)).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(payload_n(&first), 2);
    }

    #[tokio::test]
    async fn deferred_item_held_until_due() {
        let queue = RingQueue::new(RingQueueConfig::default()).unwrap();
        queue.enqueue(item(1).with_delay(Duration::from_millis(40))).await.unwrap();

        let started = Instant::now();
        let leased = queue.dequeue().await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(35));
        assert_eq!(payload_n(&leased), 1);
    }

    #[tokio::test]
    async fn unacked_item_comes_back_after_lease() {
        let queue = RingQueue::new(RingQueueConfig {
            lease_timeout: Duration::from_millis(30),
            ..Default::default()
        })
        .unwrap();
        queue.enqueue(item(1)).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(payload_n(&second), payload_n(&first));
        assert_eq!(second.dequeue_count, 2);
    }
}
