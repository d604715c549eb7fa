//! Outbox processor
//!
//! Long-lived worker that drains staged outbound messages: claim a
//! batch of due Pending entries (atomic Pending -> Processing with a
//! claim owner and time), hand each message to the dispatcher, mark
//! Processed on success, schedule a retry on failure, and dead-letter
//! entries that exhaust their retries. Claims older than the lease
//! timeout are reclaimed so a dead worker's batch is picked up again —
//! delivery is at-least-once and consumers are expected to be
//! idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use herald_common::config::OutboxConfig;
use herald_common::{
    Clock, DeadLetterContext, Outcome, OutboxEntry,
};
use herald_pipeline::{ProcessContext, Processor};
use herald_storage::{DeadLetterStore, OutboxStore, StorageResult};

pub const COMPONENT: &str = "outbox-processor";

/// Counters mirrored into the `metrics` facade.
#[derive(Debug, Clone, Default)]
pub struct OutboxMetrics {
    pub entries_claimed: u64,
    pub entries_processed: u64,
    pub entries_retried: u64,
    pub entries_dead_lettered: u64,
    pub entries_reclaimed: u64,
}

pub struct OutboxProcessor {
    config: OutboxConfig,
    store: Arc<dyn OutboxStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    dispatcher: Arc<dyn Processor>,
    clock: Arc<dyn Clock>,
    claimant: String,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    metrics: Arc<RwLock<OutboxMetrics>>,
}

impl OutboxProcessor {
    pub fn new(
        config: OutboxConfig,
        store: Arc<dyn OutboxStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        dispatcher: Arc<dyn Processor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            dead_letters,
            dispatcher,
            clock,
            claimant: format!("{}-{}", COMPONENT, uuid::Uuid::new_v4()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            metrics: Arc::new(RwLock::new(OutboxMetrics::default())),
        }
    }

    pub fn metrics(&self) -> OutboxMetrics {
        self.metrics.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Spawn the polling loop. Empty polls back off exponentially up to
    /// the configured ceiling; any claimed batch resets the cadence.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Outbox processor already running");
            return;
        }
        info!(
            polling_interval_ms = self.config.polling_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            claimant = %self.claimant,
            "Starting outbox processor"
        );

        let mut idle_delay = self.config.polling_interval;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle_delay) => {}
            }

            match self.reclaim_then_drain().await {
                Ok(0) => {
                    // Nothing to do; ease off the store.
                    idle_delay = (idle_delay * 2).min(self.config.empty_backoff_ceiling);
                }
                Ok(_) => {
                    idle_delay = self.config.polling_interval;
                }
                Err(e) => {
                    error!(error = %e, "Outbox poll failed");
                    idle_delay = (idle_delay * 2).min(self.config.empty_backoff_ceiling);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Outbox processor stopped");
    }

    async fn reclaim_then_drain(&self) -> StorageResult<usize> {
        let now = self.clock.now();

        let reclaimed = self.store.reclaim_expired(self.config.lease_timeout, now).await?;
        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed stale outbox claims");
            metrics::counter!("herald.outbox.reclaimed_total").increment(reclaimed);
            self.metrics.write().entries_reclaimed += reclaimed;
        }

        let claimed = self
            .store
            .claim_pending(self.config.batch_size, &self.claimant, now)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        debug!(count = claimed.len(), "Claimed outbox batch");
        metrics::counter!("herald.outbox.claimed_total").increment(claimed.len() as u64);
        self.metrics.write().entries_claimed += claimed.len() as u64;

        let count = claimed.len();
        for entry in claimed {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.process_entry(entry).await;
        }
        Ok(count)
    }

    async fn process_entry(&self, entry: OutboxEntry) {
        let ctx = ProcessContext::for_envelope(&entry.message, Arc::clone(&self.clock))
            .with_cancellation(self.shutdown.child_token());

        let outcome = self.dispatcher.process(&entry.message, &ctx).await;

        match outcome {
            Outcome::Success(_) => {
                if let Err(e) = self.store.mark_processed(entry.entry_id).await {
                    error!(entry_id = entry.entry_id, error = %e, "Failed to mark entry processed");
                    return;
                }
                metrics::counter!("herald.outbox.processed_total").increment(1);
                self.metrics.write().entries_processed += 1;
                debug!(entry_id = entry.entry_id, "Outbox entry processed");
            }
            Outcome::Failure(failure) => {
                self.handle_failure(entry, failure.to_string()).await;
            }
            Outcome::Skipped { reason } => {
                // A skipped dispatch is not progress; retry like a failure.
                self.handle_failure(entry, format!("dispatch skipped: {}", reason)).await;
            }
        }
    }

    async fn handle_failure(&self, entry: OutboxEntry, error_text: String) {
        let retry_count = entry.retry_count + 1;

        if retry_count < entry.max_retries {
            let backoff = retry_backoff(self.config.polling_interval, retry_count);
            let next_retry_at = self.clock.now()
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(60));
            warn!(
                entry_id = entry.entry_id,
                retry_count,
                max_retries = entry.max_retries,
                next_retry_in_ms = backoff.as_millis() as u64,
                error = %error_text,
                "Outbox dispatch failed, scheduling retry"
            );
            if let Err(e) = self
                .store
                .update_retry(entry.entry_id, retry_count, Some(next_retry_at))
                .await
            {
                error!(entry_id = entry.entry_id, error = %e, "Failed to record outbox retry");
            }
            metrics::counter!("herald.outbox.retried_total").increment(1);
            self.metrics.write().entries_retried += 1;
            return;
        }

        warn!(
            entry_id = entry.entry_id,
            retry_count,
            error = %error_text,
            "Outbox entry exhausted retries, dead-lettering"
        );
        if let Err(e) = self.store.mark_failed(entry.entry_id, &error_text).await {
            error!(entry_id = entry.entry_id, error = %e, "Failed to mark entry failed");
        }
        let context = DeadLetterContext {
            reason: "max retries exceeded".to_string(),
            component: COMPONENT.to_string(),
            retry_count,
            error: Some(error_text),
        };
        if let Err(e) = self.dead_letters.send_to_dead_letter(&entry.message, context).await {
            error!(entry_id = entry.entry_id, error = %e, "Failed to dead-letter outbox entry");
        }
        metrics::counter!("herald.outbox.dead_lettered_total").increment(1);
        self.metrics.write().entries_dead_lettered += 1;
    }
}

/// Retry backoff for a failed entry: interval * 2^n capped at a minute.
fn retry_backoff(base: Duration, retry_count: u32) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << retry_count.min(16)) as u64;
    Duration::from_millis(exp).min(Duration::from_secs(60))
}
