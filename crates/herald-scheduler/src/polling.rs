//! Storage-backed scheduler
//!
//! Persists entries in a [`ScheduledMessageStore`] and polls for entries
//! due within a look-ahead window, claiming them (Scheduled ->
//! Delivering) before invoking the delivery handler. Claim expiry
//! protects against worker death: stale Delivering entries return to
//! Scheduled on the next pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use herald_common::config::SchedulerConfig;
use herald_common::{
    Clock, Envelope, HeraldError, MessageId, ScheduleStatus, ScheduledMessage,
};
use herald_storage::ScheduledMessageStore;

use crate::{DeliveryHandler, ScheduleOptions, Scheduler};

const CLAIM_BATCH: u32 = 100;

pub struct PollingScheduler {
    config: SchedulerConfig,
    store: Arc<dyn ScheduledMessageStore>,
    handler: Arc<dyn DeliveryHandler>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl PollingScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScheduledMessageStore>,
        handler: Arc<dyn DeliveryHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, store, handler, clock, shutdown: CancellationToken::new() }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) {
        info!(
            polling_interval_ms = self.config.polling_interval.as_millis() as u64,
            look_ahead_ms = self.config.look_ahead.as_millis() as u64,
            "Starting polling scheduler"
        );
        let mut ticker =
            tokio::time::interval(self.config.polling_interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Scheduler poll failed");
                    }
                }
            }
        }
        info!("Polling scheduler stopped");
    }

    /// One poll pass, factored out for tests.
    pub async fn poll_once(&self) -> Result<usize, HeraldError> {
        let now = self.clock.now();

        let reclaimed = self
            .store
            .reclaim_expired(self.config.claim_timeout, now)
            .await
            .map_err(|e| HeraldError::Scheduler(e.to_string()))?;
        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed stale delivery claims");
        }

        let due = self
            .store
            .claim_due(now, self.config.look_ahead, CLAIM_BATCH)
            .await
            .map_err(|e| HeraldError::Scheduler(e.to_string()))?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!(count = due.len(), "Claimed due scheduled messages");
        let count = due.len();
        for entry in due {
            self.deliver_one(entry).await;
        }
        Ok(count)
    }

    async fn deliver_one(&self, entry: ScheduledMessage) {
        metrics::counter!("herald.scheduler.delivered_total").increment(1);
        match self.handler.deliver(&entry).await {
            Ok(()) => {
                let updated = match entry.recurrence {
                    Some(interval) => {
                        let next = self.clock.now()
                            + chrono::Duration::from_std(interval)
                                .unwrap_or_else(|_| chrono::Duration::hours(1));
                        self.store.reschedule(entry.id, next).await
                    }
                    None => self.store.mark_delivered(entry.id).await,
                };
                if let Err(e) = updated {
                    error!(id = %entry.id, error = %e, "Failed to record delivery");
                }
            }
            Err(e) => {
                warn!(id = %entry.id, error = %e, "Scheduled delivery failed");
                if let Err(e2) = self.store.mark_failed(entry.id, &e.to_string()).await {
                    error!(id = %entry.id, error = %e2, "Failed to record delivery failure");
                }
            }
        }
    }
}

#[async_trait]
impl Scheduler for PollingScheduler {
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
        let entry = ScheduledMessage {
            id: MessageId::new(),
            message,
            destination: destination.to_string(),
            scheduled_for: when,
            status: ScheduleStatus::Scheduled,
            created_at: self.clock.now(),
            recurrence: options.recurrence,
            claimed_at: None,
            last_error: None,
        };
        self.store
            .add(&entry)
            .await
            .map_err(|e| HeraldError::Scheduler(e.to_string()))?;
        Ok(entry.id)
    }

    async fn cancel(&self, id: MessageId) -> Result<bool, HeraldError> {
        self.store.cancel(id).await.map_err(|e| HeraldError::Scheduler(e.to_string()))
    }
}
