//! The producer-facing message bus
//!
//! Everything the core exposes outward: Send (commands and queries),
//! Publish (events), PublishToOutbox, ProcessIncoming, named queue
//! operations, and scheduling. `start()` brings up the background
//! workers (outbox processor, inbox cleanup, scheduler dispatcher, saga
//! timeout pollers, idempotency sweeper); `shutdown()` stops them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use herald_common::{
    Clock, EnqueueOptions, Envelope, ErrorKind, HeraldConfig, HeraldError, InboxOptions, MessageId,
    MessagePayload, Outcome, OutboxEntry, OutboxPublishOptions, ProcessingFailure,
};
use herald_dispatch::HandlerRegistry;
use herald_inbox::{InboxCleanupTask, InboxOutcome, InboxProcessor};
use herald_outbox::OutboxProcessor;
use herald_pipeline::{Pipeline, ProcessContext, Processor};
use herald_scheduler::{InMemoryScheduler, ScheduleOptions, Scheduler};
use herald_storage::{DeadLetterStore, IdempotencyStore, InboxStore, OutboxStore};

use crate::queues::QueueManager;

type WorkerFactory = Box<dyn FnOnce() -> (JoinHandle<()>, CancellationToken) + Send>;

/// Everything the builder wires together.
pub(crate) struct HeraldParts {
    pub config: HeraldConfig,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<HandlerRegistry>,
    pub pipeline: Pipeline,
    pub root: Arc<dyn Processor>,
    pub outbox_store: Arc<dyn OutboxStore>,
    pub inbox_store: Arc<dyn InboxStore>,
    pub dead_letter_store: Arc<dyn DeadLetterStore>,
    pub idempotency_store: Arc<dyn IdempotencyStore>,
    pub outbox_processor: Arc<OutboxProcessor>,
    pub inbox_processor: Arc<InboxProcessor>,
    pub scheduler: Arc<InMemoryScheduler>,
    pub queues: Arc<QueueManager>,
    pub saga_workers: Vec<WorkerFactory>,
}

pub struct Herald {
    config: HeraldConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<HandlerRegistry>,
    pipeline: Option<Pipeline>,
    root: Arc<dyn Processor>,
    outbox_store: Arc<dyn OutboxStore>,
    inbox_store: Arc<dyn InboxStore>,
    dead_letter_store: Arc<dyn DeadLetterStore>,
    idempotency_store: Arc<dyn IdempotencyStore>,
    outbox_processor: Arc<OutboxProcessor>,
    inbox_processor: Arc<InboxProcessor>,
    scheduler: Arc<InMemoryScheduler>,
    queues: Arc<QueueManager>,
    saga_workers: Mutex<Vec<WorkerFactory>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_tokens: Mutex<Vec<CancellationToken>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Herald {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Herald").finish_non_exhaustive()
    }
}

impl Herald {
    pub(crate) fn assemble(parts: HeraldParts) -> Self {
        Self {
            config: parts.config,
            clock: parts.clock,
            registry: parts.registry,
            pipeline: Some(parts.pipeline),
            root: parts.root,
            outbox_store: parts.outbox_store,
            inbox_store: parts.inbox_store,
            dead_letter_store: parts.dead_letter_store,
            idempotency_store: parts.idempotency_store,
            outbox_processor: parts.outbox_processor,
            inbox_processor: parts.inbox_processor,
            scheduler: parts.scheduler,
            queues: parts.queues,
            saga_workers: Mutex::new(parts.saga_workers),
            workers: Mutex::new(Vec::new()),
            worker_tokens: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Start the background workers. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting Herald runtime");

        let mut workers = self.workers.lock();
        let mut tokens = self.worker_tokens.lock();

        workers.push(Arc::clone(&self.outbox_processor).spawn());
        workers.push(self.scheduler.spawn_dispatcher());
        tokens.push(self.scheduler.shutdown_token());

        let cleanup = InboxCleanupTask::new(
            self.config.inbox.clone(),
            Arc::clone(&self.inbox_store),
            Arc::clone(&self.clock),
        );
        tokens.push(cleanup.shutdown_token());
        workers.push(cleanup.spawn());

        let sweeper_token = CancellationToken::new();
        tokens.push(sweeper_token.clone());
        workers.push(crate::builder::spawn_idempotency_sweeper(
            Arc::clone(&self.idempotency_store),
            sweeper_token,
        ));

        for factory in self.saga_workers.lock().drain(..) {
            let (handle, token) = factory();
            workers.push(handle);
            tokens.push(token);
        }
    }

    /// Stop background workers and flush the pipeline's batches.
    pub async fn shutdown(&mut self) {
        info!("Shutting down Herald runtime");
        self.outbox_processor.stop();
        for token in self.worker_tokens.lock().drain(..) {
            token.cancel();
        }
        self.queues.stop_all().await;

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown().await;
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn context_for(&self, envelope: &Envelope) -> ProcessContext {
        ProcessContext::for_envelope(envelope, Arc::clone(&self.clock))
    }

    // ------------------------------------------------------------------
    // Producer-facing surface
    // ------------------------------------------------------------------

    /// Send a command through the pipeline to its single handler.
    pub async fn send<T: MessagePayload>(&self, command: &T) -> Outcome {
        match Envelope::command(command) {
            Ok(envelope) => self.send_envelope(&envelope).await,
            Err(e) => serialization_failure(e),
        }
    }

    /// Send a query; Success always carries the handler's result.
    pub async fn send_query<T: MessagePayload>(&self, query: &T) -> Outcome {
        match Envelope::query(query) {
            Ok(envelope) => self.send_envelope(&envelope).await,
            Err(e) => serialization_failure(e),
        }
    }

    /// Publish an event to every subscriber.
    pub async fn publish<T: MessagePayload>(&self, event: &T) -> Outcome {
        match Envelope::event(event) {
            Ok(envelope) => self.send_envelope(&envelope).await,
            Err(e) => serialization_failure(e),
        }
    }

    /// Dispatch a pre-built envelope of any kind.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Outcome {
        let ctx = self.context_for(envelope);
        self.root.process(envelope, &ctx).await
    }

    /// Stage an event into the outbox for asynchronous delivery. The
    /// staging write shares the caller's ambient transaction when the
    /// configured outbox store participates in one.
    pub async fn publish_to_outbox(
        &self,
        envelope: &Envelope,
        options: OutboxPublishOptions,
    ) -> Result<OutboxEntry, HeraldError> {
        self.outbox_store
            .add(envelope, options)
            .await
            .map_err(|e| HeraldError::Storage(e.to_string()))
    }

    /// Hand an incoming message to the deduplicating inbox.
    pub async fn process_incoming(
        &self,
        envelope: &Envelope,
        options: InboxOptions,
    ) -> Result<InboxOutcome, HeraldError> {
        self.inbox_processor
            .process_incoming(envelope, options)
            .await
            .map_err(|e| HeraldError::Storage(e.to_string()))
    }

    /// Add a message to a named in-memory queue; returns the message id
    /// as the receipt.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        envelope: Envelope,
        options: EnqueueOptions,
    ) -> Result<MessageId, HeraldError> {
        self.queues.enqueue(queue_name, envelope, options).await
    }

    /// Start the worker draining a named queue.
    pub fn start_queue(&self, queue_name: &str) -> Result<(), HeraldError> {
        self.queues.start_queue(queue_name)
    }

    pub async fn stop_queue(&self, queue_name: &str) -> Result<(), HeraldError> {
        self.queues.stop_queue(queue_name).await
    }

    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.queues.depth(queue_name)
    }

    /// Schedule an envelope for delayed delivery.
    pub async fn schedule(
        &self,
        envelope: Envelope,
        destination: &str,
        when: DateTime<Utc>,
    ) -> Result<MessageId, HeraldError> {
        self.scheduler.schedule(envelope, destination, when, ScheduleOptions::default()).await
    }

    pub async fn schedule_recurring(
        &self,
        envelope: Envelope,
        destination: &str,
        when: DateTime<Utc>,
        every: std::time::Duration,
    ) -> Result<MessageId, HeraldError> {
        self.scheduler
            .schedule(envelope, destination, when, ScheduleOptions { recurrence: Some(every) })
            .await
    }

    /// Advisory cancellation of a scheduled message.
    pub async fn cancel_scheduled(&self, id: MessageId) -> Result<bool, HeraldError> {
        self.scheduler.cancel(id).await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn config(&self) -> &HeraldConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letter_store
    }

    pub fn outbox(&self) -> &Arc<dyn OutboxStore> {
        &self.outbox_store
    }

    pub fn outbox_metrics(&self) -> herald_outbox::OutboxMetrics {
        self.outbox_processor.metrics()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

fn serialization_failure(e: serde_json::Error) -> Outcome {
    Outcome::Failure(
        ProcessingFailure::new(ErrorKind::Validation, "payload serialization failed")
            .with_cause(e.to_string()),
    )
}
