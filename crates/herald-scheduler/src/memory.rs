//! In-memory scheduler
//!
//! A min-heap keyed by due time and a single dispatcher task that sleeps
//! until the earliest deadline. Inserting an entry earlier than the
//! current head nudges the timer through a Notify so the new deadline is
//! honoured.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use herald_common::{
    Clock, Envelope, HeraldError, MessageId, ScheduleStatus, ScheduledMessage,
};

use crate::{DeliveryHandler, ScheduleOptions, Scheduler};

#[derive(Default)]
struct SchedulerState {
    entries: HashMap<MessageId, ScheduledMessage>,
    /// Min-heap on (due, id); stale keys are skipped on pop.
    order: BinaryHeap<Reverse<(DateTime<Utc>, uuid::Uuid)>>,
}

pub struct InMemoryScheduler {
    state: Arc<Mutex<SchedulerState>>,
    handler: Arc<dyn DeliveryHandler>,
    clock: Arc<dyn Clock>,
    timer_reset: Arc<Notify>,
    shutdown: CancellationToken,
}

impl InMemoryScheduler {
    pub fn new(handler: Arc<dyn DeliveryHandler>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            handler,
            clock,
            timer_reset: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.status == ScheduleStatus::Scheduled)
            .count()
    }

    /// Spawn the dispatcher task.
    pub fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let handler = Arc::clone(&self.handler);
        let clock = Arc::clone(&self.clock);
        let timer_reset = Arc::clone(&self.timer_reset);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!("Starting in-memory scheduler dispatcher");
            loop {
                if shutdown.is_cancelled() {
                    break;
                }

                // Pull everything due; remember the next deadline.
                let now = clock.now();
                let (due, next_deadline) = {
                    let mut state = state.lock();
                    let mut due = Vec::new();
                    let next_deadline = loop {
                        match state.order.peek().copied() {
                            Some(Reverse((at, id))) if at <= now => {
                                state.order.pop();
                                let id = MessageId::from(id);
                                if let Some(entry) = state.entries.get_mut(&id) {
                                    if entry.status == ScheduleStatus::Scheduled {
                                        entry.status = ScheduleStatus::Delivering;
                                        entry.claimed_at = Some(now);
                                        due.push(entry.clone());
                                    }
                                }
                            }
                            Some(Reverse((at, _))) => break Some(at),
                            None => break None,
                        }
                    };
                    (due, next_deadline)
                };

                for entry in due {
                    Self::deliver_one(&state, &handler, &clock, entry).await;
                }

                let sleep_for = match next_deadline {
                    Some(at) => {
                        let until = at - clock.now();
                        until.to_std().unwrap_or(Duration::ZERO)
                    }
                    None => Duration::from_secs(3600),
                };

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer_reset.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
            info!("In-memory scheduler dispatcher stopped");
        })
    }

    async fn deliver_one(
        state: &Arc<Mutex<SchedulerState>>,
        handler: &Arc<dyn DeliveryHandler>,
        clock: &Arc<dyn Clock>,
        entry: ScheduledMessage,
    ) {
        debug!(id = %entry.id, destination = %entry.destination, "Delivering scheduled message");
        metrics::counter!("herald.scheduler.delivered_total").increment(1);

        let result = handler.deliver(&entry).await;
        let mut state = state.lock();

        // Re-arm a recurring entry for its next occurrence; anything
        // else settles into a terminal status.
        let rearm_at = match (&result, entry.recurrence) {
            (Ok(()), Some(interval)) => Some(
                clock.now()
                    + chrono::Duration::from_std(interval)
                        .unwrap_or_else(|_| chrono::Duration::hours(1)),
            ),
            _ => None,
        };

        if let Some(stored) = state.entries.get_mut(&entry.id) {
            stored.claimed_at = None;
            match (&result, rearm_at) {
                (Ok(()), Some(next)) => {
                    stored.status = ScheduleStatus::Scheduled;
                    stored.scheduled_for = next;
                }
                (Ok(()), None) => {
                    stored.status = ScheduleStatus::Delivered;
                }
                (Err(e), _) => {
                    warn!(id = %entry.id, error = %e, "Scheduled delivery failed");
                    stored.status = ScheduleStatus::Failed;
                    stored.last_error = Some(e.to_string());
                }
            }
        }
        if let Some(next) = rearm_at {
            state.order.push(Reverse((next, *entry.id.as_uuid())));
        }
    }

    pub fn get(&self, id: MessageId) -> Option<ScheduledMessage> {
        self.state.lock().entries.get(&id).cloned()
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn schedule(
        &self,
        message: Envelope,
        destination: &str,
        when: DateTime<Utc>,
        options: ScheduleOptions,
    ) -> Result<MessageId, HeraldError> {
        if self.shutdown.is_cancelled() {
            return Err(HeraldError::ShutdownInProgress);
        }
        let id = MessageId::new();
        let entry = ScheduledMessage {
            id,
            message,
            destination: destination.to_string(),
            scheduled_for: when,
            status: ScheduleStatus::Scheduled,
            created_at: self.clock.now(),
            recurrence: options.recurrence,
            claimed_at: None,
            last_error: None,
        };

        let became_head = {
            let mut state = self.state.lock();
            let head = state.order.peek().map(|Reverse((at, _))| *at);
            state.order.push(Reverse((when, *id.as_uuid())));
            state.entries.insert(id, entry);
            head.map_or(true, |at| when < at)
        };
        if became_head {
            // Wake the dispatcher so the nearer deadline is honoured.
            self.timer_reset.notify_one();
        }
        Ok(id)
    }

    async fn cancel(&self, id: MessageId) -> Result<bool, HeraldError> {
        let mut state = self.state.lock();
        match state.entries.get_mut(&id) {
            Some(entry) if entry.status == ScheduleStatus::Scheduled => {
                entry.status = ScheduleStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FnDeliveryHandler;
    use herald_common::{system_clock, MessageKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn envelope() -> Envelope {
        Envelope::from_parts(
            MessageId::new(),
            MessageKind::Event,
            "reminders.due",
            serde_json::json!({}),
        )
    }

    fn counting_handler(calls: Arc<AtomicU32>) -> Arc<dyn DeliveryHandler> {
        Arc::new(FnDeliveryHandler(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn delivers_within_window() {
        let calls = Arc::new(AtomicU32::new(0));
        let scheduler = InMemoryScheduler::new(counting_handler(Arc::clone(&calls)), system_clock());
        let _dispatcher = scheduler.spawn_dispatcher();

        let started = Instant::now();
        scheduler
            .schedule(
                envelope(),
                "dest",
                Utc::now() + chrono::Duration::milliseconds(50),
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        while calls.load(Ordering::SeqCst) == 0 && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let elapsed = started.elapsed();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(elapsed >= Duration::from_millis(45), "fired too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "fired too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn past_due_delivers_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let scheduler = InMemoryScheduler::new(counting_handler(Arc::clone(&calls)), system_clock());
        let _dispatcher = scheduler.spawn_dispatcher();

        scheduler
            .schedule(
                envelope(),
                "dest",
                Utc::now() - chrono::Duration::seconds(5),
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        let started = Instant::now();
        while calls.load(Ordering::SeqCst) == 0 && started.elapsed() < Duration::from_secs(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn earlier_insert_resets_the_timer() {
        let calls = Arc::new(AtomicU32::new(0));
        let scheduler = InMemoryScheduler::new(counting_handler(Arc::clone(&calls)), system_clock());
        let _dispatcher = scheduler.spawn_dispatcher();

        // A far-future entry parks the dispatcher; the near one must
        // still fire on time.
        scheduler
            .schedule(envelope(), "far", Utc::now() + chrono::Duration::hours(1), ScheduleOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        scheduler
            .schedule(
                envelope(),
                "near",
                Utc::now() + chrono::Duration::milliseconds(40),
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        while calls.load(Ordering::SeqCst) == 0 && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancel_before_due_prevents_delivery() {
        let calls = Arc::new(AtomicU32::new(0));
        let scheduler = InMemoryScheduler::new(counting_handler(Arc::clone(&calls)), system_clock());
        let _dispatcher = scheduler.spawn_dispatcher();

        let id = scheduler
            .schedule(
                envelope(),
                "dest",
                Utc::now() + chrono::Duration::milliseconds(60),
                ScheduleOptions::default(),
            )
            .await
            .unwrap();
        assert!(scheduler.cancel(id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.get(id).unwrap().status, ScheduleStatus::Cancelled);
    }

    #[tokio::test]
    async fn recurring_entry_re_arms_after_delivery() {
        let calls = Arc::new(AtomicU32::new(0));
        let scheduler = InMemoryScheduler::new(counting_handler(Arc::clone(&calls)), system_clock());
        let _dispatcher = scheduler.spawn_dispatcher();

        let id = scheduler
            .schedule(
                envelope(),
                "dest",
                Utc::now() + chrono::Duration::milliseconds(20),
                ScheduleOptions { recurrence: Some(Duration::from_millis(30)) },
            )
            .await
            .unwrap();

        let started = Instant::now();
        while calls.load(Ordering::SeqCst) < 3 && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(calls.load(Ordering::SeqCst) >= 3);

        // Cancelling stops future re-arms.
        scheduler.cancel(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_cancel = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_cancel);
    }
}
