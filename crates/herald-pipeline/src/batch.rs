//! Batch decorator
//!
//! Accumulates messages per batch key (default: the message type tag)
//! and dispatches them together when the batch reaches MaxBatchSize or
//! the oldest member has waited BatchTimeout. Each caller parks on a
//! oneshot channel and receives its own outcome when its message is
//! dispatched. Parallelism within a batch is bounded by
//! MaxDegreeOfParallelism; when continue_on_failure is off, the first
//! failure aborts the not-yet-started remainder (which is re-run
//! individually when fallback_to_single is set).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use herald_common::config::BatchingConfig;
use herald_common::{Envelope, ErrorKind, Outcome, ProcessingFailure};

use crate::processor::{ProcessContext, Processor};

/// Derives the accumulation key for an envelope.
pub trait BatchKeyGenerator: Send + Sync {
    fn key(&self, envelope: &Envelope) -> String;
}

/// Default grouping: one batch per message type.
pub struct TypeTagBatchKey;

impl BatchKeyGenerator for TypeTagBatchKey {
    fn key(&self, envelope: &Envelope) -> String {
        envelope.message_type.clone()
    }
}

struct PendingMessage {
    envelope: Envelope,
    ctx: ProcessContext,
    enqueued: Instant,
    done: oneshot::Sender<Outcome>,
}

/// Accumulation state and dispatch machinery, shared between the
/// decorator frames and the flush task.
struct BatchCore {
    config: BatchingConfig,
    pending: DashMap<String, Vec<PendingMessage>>,
    semaphore: Arc<Semaphore>,
    inner: Arc<dyn Processor>,
}

impl BatchCore {
    fn take_batch(&self, key: &str) -> Vec<PendingMessage> {
        self.pending.remove(key).map(|(_, batch)| batch).unwrap_or_default()
    }

    async fn flush_expired(self: &Arc<Self>) {
        let timeout = self.config.batch_timeout;
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| {
                entry.value().first().map_or(false, |oldest| oldest.enqueued.elapsed() >= timeout)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in due {
            let batch = self.take_batch(&key);
            if !batch.is_empty() {
                debug!(key = %key, size = batch.len(), "Flushing batch on timeout");
                let core = Arc::clone(self);
                tokio::spawn(async move { core.dispatch_batch(batch).await });
            }
        }
    }

    async fn flush_all(self: &Arc<Self>) {
        let keys: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            let batch = self.take_batch(&key);
            if !batch.is_empty() {
                self.dispatch_batch(batch).await;
            }
        }
    }

    /// Run one batch through the inner processor. Below min_batch_size
    /// the members are processed as plain individual messages; at or
    /// above it the batch abort semantics apply.
    async fn dispatch_batch(self: &Arc<Self>, batch: Vec<PendingMessage>) {
        let batch_semantics = batch.len() >= self.config.min_batch_size;
        let aborted = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(batch.len());

        for message in batch {
            // Acquiring in submission order keeps FIFO fairness within
            // the batch even under bounded parallelism.
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let core = Arc::clone(self);
            let aborted = Arc::clone(&aborted);
            workers.push(tokio::spawn(async move {
                let _permit = permit;
                let PendingMessage { envelope, ctx, done, .. } = message;

                if batch_semantics && aborted.load(Ordering::SeqCst) {
                    if core.config.fallback_to_single {
                        // Aborted batch falls back to per-message dispatch.
                        let outcome = core.inner.process(&envelope, &ctx).await;
                        let _ = done.send(outcome);
                    } else {
                        let _ = done.send(Outcome::skipped("batch aborted by earlier failure"));
                    }
                    return;
                }

                let outcome = if let Some(failure) = ctx.interruption() {
                    Outcome::Failure(failure)
                } else {
                    core.inner.process(&envelope, &ctx).await
                };

                if batch_semantics && !core.config.continue_on_failure && outcome.is_failure() {
                    aborted.store(true, Ordering::SeqCst);
                }
                let _ = done.send(outcome);
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }
    }
}

pub struct BatchDecorator {
    core: Arc<BatchCore>,
    keyer: Arc<dyn BatchKeyGenerator>,
    shutdown: CancellationToken,
}

impl BatchDecorator {
    pub fn new(config: BatchingConfig, inner: Arc<dyn Processor>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_degree_of_parallelism));
        Self {
            core: Arc::new(BatchCore { config, pending: DashMap::new(), semaphore, inner }),
            keyer: Arc::new(TypeTagBatchKey),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_key_generator(mut self, keyer: Arc<dyn BatchKeyGenerator>) -> Self {
        self.keyer = keyer;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the timer task that flushes batches whose oldest member has
    /// waited out the batch timeout. On shutdown every remaining batch
    /// is flushed so no caller stays parked.
    pub fn spawn_flush_task(&self) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let shutdown = self.shutdown.clone();
        let tick = (core.config.batch_timeout / 4).max(Duration::from_millis(5));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        core.flush_all().await;
                        break;
                    }
                    _ = ticker.tick() => {
                        core.flush_expired().await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Processor for BatchDecorator {
    async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        if let Some(failure) = ctx.interruption() {
            return Outcome::Failure(failure);
        }

        let key = self.keyer.key(envelope);
        let (done, receiver) = oneshot::channel();

        let full_batch = {
            let mut slot = self.core.pending.entry(key.clone()).or_default();
            slot.push(PendingMessage {
                envelope: envelope.clone(),
                ctx: ctx.clone(),
                enqueued: Instant::now(),
                done,
            });
            if slot.len() >= self.core.config.max_batch_size {
                Some(std::mem::take(slot.value_mut()))
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            debug!(key = %key, size = batch.len(), "Flushing batch at max size");
            self.core.dispatch_batch(batch).await;
        }

        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                Outcome::Failure(ProcessingFailure::cancelled())
            }
            outcome = receiver => outcome.unwrap_or_else(|_| {
                Outcome::Failure(ProcessingFailure::new(
                    ErrorKind::Cancelled,
                    "batch dispatcher shut down before the message was processed",
                ))
            }),
        }
    }
}
