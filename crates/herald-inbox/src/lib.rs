//! Inbox processor
//!
//! Deduplicated receive: record the incoming message identity, skip
//! dispatch when a prior entry blocks it, and otherwise hand the message
//! to the dispatcher. The inbox guarantees at-most-once processing per
//! (source, MessageId); retrying failed dispatches is the Retry
//! decorator's job, not the inbox's. A cleanup worker purges Processed
//! entries past the retention window.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use herald_common::config::InboxConfig;
use herald_common::{Clock, Envelope, InboxOptions, Outcome};
use herald_pipeline::{ProcessContext, Processor};
use herald_storage::{InboxStore, StorageError};

pub const COMPONENT: &str = "inbox-processor";

/// Result of handing a message to the inbox.
#[derive(Debug)]
pub enum InboxOutcome {
    /// The message was new; the dispatch outcome is attached.
    Processed(Outcome),
    /// A prior entry for this identity blocked re-processing.
    Duplicate,
}

impl InboxOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, InboxOutcome::Duplicate)
    }
}

pub struct InboxProcessor {
    config: InboxConfig,
    store: Arc<dyn InboxStore>,
    dispatcher: Arc<dyn Processor>,
    clock: Arc<dyn Clock>,
}

impl InboxProcessor {
    pub fn new(
        config: InboxConfig,
        store: Arc<dyn InboxStore>,
        dispatcher: Arc<dyn Processor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, store, dispatcher, clock }
    }

    /// The dedupe key: the MessageId, scoped by source when one is
    /// given.
    fn dedupe_key(envelope: &Envelope, options: &InboxOptions) -> String {
        match &options.source {
            Some(source) => format!("{}:{}", source, envelope.id),
            None => envelope.id.to_string(),
        }
    }

    /// Record and dispatch one incoming message.
    pub async fn process_incoming(
        &self,
        envelope: &Envelope,
        options: InboxOptions,
    ) -> Result<InboxOutcome, StorageError> {
        let key = Self::dedupe_key(envelope, &options);

        if self.config.require_idempotency {
            let window = options.idempotency_window;
            if self.store.is_duplicate(&key, window).await? {
                debug!(message_id = %envelope.id, key = %key, "Duplicate message skipped");
                metrics::counter!("herald.inbox.duplicates_total").increment(1);
                return Ok(InboxOutcome::Duplicate);
            }
        }

        // The insert is the atomic claim on this identity. The store
        // reclaims a stale Failed entry outside its window; losing the
        // race to any other entry means duplicate.
        let inserted = self.store.add(&key, envelope, options).await?;
        if inserted.is_none() {
            debug!(message_id = %envelope.id, key = %key, "Lost insert race, duplicate");
            metrics::counter!("herald.inbox.duplicates_total").increment(1);
            return Ok(InboxOutcome::Duplicate);
        }

        // Dispatch happens outside the insert; a crash here leaves a
        // Pending entry that blocks duplicates and is visible to
        // operators via get_unprocessed.
        let ctx = ProcessContext::for_envelope(envelope, Arc::clone(&self.clock));
        let outcome = self.dispatcher.process(envelope, &ctx).await;

        match &outcome {
            Outcome::Success(_) => {
                self.store.mark_processed(&key).await?;
                metrics::counter!("herald.inbox.processed_total").increment(1);
            }
            Outcome::Failure(failure) => {
                self.store.mark_failed(&key, &failure.to_string()).await?;
                metrics::counter!("herald.inbox.failed_total").increment(1);
                warn!(
                    message_id = %envelope.id,
                    kind = %failure.kind,
                    "Inbox dispatch failed; entry marked Failed"
                );
            }
            Outcome::Skipped { reason } => {
                self.store.mark_failed(&key, &format!("skipped: {}", reason)).await?;
            }
        }

        Ok(InboxOutcome::Processed(outcome))
    }

    pub async fn unprocessed_count(&self) -> Result<u64, StorageError> {
        self.store.get_unprocessed_count().await
    }
}

/// Background retention sweeper for the inbox store.
pub struct InboxCleanupTask {
    config: InboxConfig,
    store: Arc<dyn InboxStore>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl InboxCleanupTask {
    pub fn new(config: InboxConfig, store: Arc<dyn InboxStore>, clock: Arc<dyn Clock>) -> Self {
        Self { config, store, clock, shutdown: CancellationToken::new() }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        info!(
            retention_secs = self.config.retention.as_secs(),
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            "Starting inbox cleanup task"
        );
        let mut ticker = tokio::time::interval(self.config.cleanup_interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cutoff = self.clock.now()
                        - chrono::Duration::from_std(self.config.retention)
                            .unwrap_or_else(|_| chrono::Duration::days(7));
                    match self.store.cleanup_old_entries(cutoff).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            info!(removed, "Purged processed inbox entries");
                            metrics::counter!("herald.inbox.purged_total").increment(removed);
                        }
                        Err(e) => warn!(error = %e, "Inbox cleanup failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::{system_clock, ErrorKind, ManualClock, MessageId, MessageKind};
    use herald_pipeline::FnProcessor;
    use herald_storage::InMemoryInboxStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn envelope() -> Envelope {
        Envelope::from_parts(
            MessageId::new(),
            MessageKind::Command,
            "payments.charge",
            serde_json::json!({}),
        )
    }

    fn counting_dispatcher(calls: Arc<AtomicU32>) -> Arc<dyn Processor> {
        Arc::new(FnProcessor::new(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Outcome::success()
            }
        }))
    }

    fn processor(dispatcher: Arc<dyn Processor>) -> InboxProcessor {
        InboxProcessor::new(
            InboxConfig::default(),
            Arc::new(InMemoryInboxStore::new(system_clock())),
            dispatcher,
            system_clock(),
        )
    }

    #[tokio::test]
    async fn same_message_twice_processes_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let inbox = processor(counting_dispatcher(Arc::clone(&calls)));
        let message = envelope();

        let first = inbox.process_incoming(&message, InboxOptions::default()).await.unwrap();
        let second = inbox.process_incoming(&message, InboxOptions::default()).await.unwrap();

        assert!(matches!(first, InboxOutcome::Processed(Outcome::Success(_))));
        assert!(second.is_duplicate());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_id_different_source_is_not_duplicate() {
        let calls = Arc::new(AtomicU32::new(0));
        let inbox = processor(counting_dispatcher(Arc::clone(&calls)));
        let message = envelope();

        let options_a = InboxOptions { source: Some("billing".into()), ..Default::default() };
        let options_b = InboxOptions { source: Some("shipping".into()), ..Default::default() };
        inbox.process_incoming(&message, options_a).await.unwrap();
        let second = inbox.process_incoming(&message, options_b).await.unwrap();

        assert!(!second.is_duplicate());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Dispatcher that fails its first `failures` invocations and
    /// succeeds afterwards.
    fn flaky_dispatcher(calls: Arc<AtomicU32>, failures: u32) -> Arc<dyn Processor> {
        Arc::new(FnProcessor::new(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt < failures {
                    Outcome::failure(ErrorKind::Permanent, "handler rejected")
                } else {
                    Outcome::success()
                }
            }
        }))
    }

    #[tokio::test]
    async fn failed_dispatch_marks_failed_without_inbox_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Arc::new(InMemoryInboxStore::new(system_clock()));
        let inbox = InboxProcessor::new(
            InboxConfig::default(),
            Arc::clone(&store) as Arc<dyn InboxStore>,
            flaky_dispatcher(Arc::clone(&calls), u32::MAX),
            system_clock(),
        );
        let message = envelope();

        let outcome = inbox.process_incoming(&message, InboxOptions::default()).await.unwrap();
        assert!(matches!(outcome, InboxOutcome::Processed(Outcome::Failure(_))));
        // One call in, one dispatch out: the inbox records the failure
        // and stops; retrying is the pipeline's business.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entry = store.get(&message.id.to_string()).await.unwrap().unwrap();
        assert_eq!(entry.status, herald_common::InboxStatus::Failed);
        assert!(entry.error.as_deref().unwrap_or("").contains("handler rejected"));
    }

    #[tokio::test]
    async fn failed_entry_redispatched_once_window_lapses() {
        let clock = Arc::new(ManualClock::starting_now());
        let calls = Arc::new(AtomicU32::new(0));
        let store = Arc::new(InMemoryInboxStore::new(clock.clone()));
        let inbox = InboxProcessor::new(
            InboxConfig::default(),
            Arc::clone(&store) as Arc<dyn InboxStore>,
            flaky_dispatcher(Arc::clone(&calls), 1),
            clock.clone(),
        );
        let message = envelope();
        let options = InboxOptions {
            idempotency_window: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let first = inbox.process_incoming(&message, options.clone()).await.unwrap();
        assert!(matches!(first, InboxOutcome::Processed(Outcome::Failure(_))));

        // Inside the window the failed entry still counts as seen.
        let second = inbox.process_incoming(&message, options.clone()).await.unwrap();
        assert!(second.is_duplicate());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(61));
        let third = inbox.process_incoming(&message, options).await.unwrap();
        assert!(matches!(third, InboxOutcome::Processed(Outcome::Success(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let entry = store.get(&message.id.to_string()).await.unwrap().unwrap();
        assert_eq!(entry.status, herald_common::InboxStatus::Processed);
    }

    #[tokio::test]
    async fn failed_entry_without_window_redispatched_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let inbox = processor(flaky_dispatcher(Arc::clone(&calls), 1));
        let message = envelope();

        let first = inbox.process_incoming(&message, InboxOptions::default()).await.unwrap();
        assert!(matches!(first, InboxOutcome::Processed(Outcome::Failure(_))));

        // No window configured: a failed message is immediately
        // eligible again.
        let second = inbox.process_incoming(&message, InboxOptions::default()).await.unwrap();
        assert!(matches!(second, InboxOutcome::Processed(Outcome::Success(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
