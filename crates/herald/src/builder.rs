//! Runtime builder
//!
//! Explicit constructor-time wiring: handlers are registered up front,
//! stores default to the in-memory adapters, and build() produces a
//! fully-wired [`crate::Herald`] after validating the whole
//! configuration. There is no container and no runtime type lookup; the
//! registry the dispatcher uses is frozen here.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use herald_common::{system_clock, Clock, Envelope, HeraldConfig, HeraldError, Outcome, SagaState};
use herald_dispatch::{DispatchProcessor, Dispatcher, EventDispatchMode, HandlerRegistry, MessageHandler};
use herald_inbox::InboxProcessor;
use herald_outbox::OutboxProcessor;
use herald_pipeline::{PipelineBuilder, ProcessContext, UnitOfWorkFactory};
use herald_saga::{
    SagaOrchestrator, SagaTimeoutHandler, SagaTimeoutOptions, SagaTimeoutRegistry,
    StateMachineDefinition,
};
use herald_scheduler::{DeliveryHandler, InMemoryScheduler};
use herald_storage::{
    idempotency::spawn_sweeper, DeadLetterStore, IdempotencyStore, InMemoryDeadLetterStore,
    InMemoryIdempotencyStore, InMemoryInboxStore, InMemoryOutboxStore, InMemorySagaRepository,
    InboxStore, OutboxStore, SagaRepository,
};

use crate::bus::Herald;
use crate::queues::QueueManager;

/// Adapts a saga orchestrator into an event-bus handler.
struct SagaEventHandler<S: SagaState> {
    orchestrator: Arc<SagaOrchestrator<S>>,
}

#[async_trait]
impl<S: SagaState> MessageHandler for SagaEventHandler<S> {
    async fn handle(&self, envelope: &Envelope, _ctx: &ProcessContext) -> Outcome {
        self.orchestrator.handle_event(envelope).await
    }
}

type WorkerFactory = Box<dyn FnOnce() -> (JoinHandle<()>, CancellationToken) + Send>;

pub struct HeraldBuilder {
    config: HeraldConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<HandlerRegistry>,
    event_mode: EventDispatchMode,
    outbox_store: Option<Arc<dyn OutboxStore>>,
    inbox_store: Option<Arc<dyn InboxStore>>,
    dead_letter_store: Option<Arc<dyn DeadLetterStore>>,
    idempotency_store: Option<Arc<dyn IdempotencyStore>>,
    unit_of_work_factory: Option<Arc<dyn UnitOfWorkFactory>>,
    enable_validation: bool,
    enable_idempotency: bool,
    enable_batching: bool,
    enable_retry: bool,
    enable_circuit_breaker: bool,
    timeout_registry: Arc<SagaTimeoutRegistry>,
    saga_workers: Vec<WorkerFactory>,
}

impl HeraldBuilder {
    pub fn new() -> Self {
        Self::with_config(HeraldConfig::default())
    }

    pub fn with_config(config: HeraldConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            registry: Arc::new(HandlerRegistry::new()),
            event_mode: EventDispatchMode::default(),
            outbox_store: None,
            inbox_store: None,
            dead_letter_store: None,
            idempotency_store: None,
            unit_of_work_factory: None,
            enable_validation: true,
            enable_idempotency: false,
            enable_batching: false,
            enable_retry: true,
            enable_circuit_breaker: false,
            timeout_registry: Arc::new(SagaTimeoutRegistry::default()),
            saga_workers: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_mode(mut self, mode: EventDispatchMode) -> Self {
        self.event_mode = mode;
        self
    }

    // Handler registration.

    pub fn register_command(
        self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.registry.register_command(message_type, handler);
        self
    }

    pub fn register_query(
        self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.registry.register_query(message_type, handler);
        self
    }

    pub fn subscribe(
        self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.registry.subscribe(message_type, handler);
        self
    }

    /// Register a saga: its orchestrator subscribes to `events` (which
    /// must include the initial trigger) and to its timeout event, and a
    /// timeout poller for the saga type is started with the runtime.
    pub fn register_saga<S: SagaState>(
        mut self,
        definition: StateMachineDefinition<S>,
        repository: Arc<dyn SagaRepository<S>>,
        events: &[&str],
    ) -> Self {
        let orchestrator = Arc::new(SagaOrchestrator::new(
            definition,
            Arc::clone(&repository),
            Arc::clone(&self.clock),
        ));

        let timeout_options = self.timeout_registry.options_for(S::saga_type());
        for event in events {
            self.registry.subscribe(
                event.to_string(),
                Arc::new(SagaEventHandler { orchestrator: Arc::clone(&orchestrator) }),
            );
        }
        self.registry.subscribe(
            timeout_options.timeout_event.clone(),
            Arc::new(SagaEventHandler { orchestrator: Arc::clone(&orchestrator) }),
        );

        let registry = Arc::clone(&self.timeout_registry);
        let clock = Arc::clone(&self.clock);
        self.saga_workers.push(Box::new(move || {
            let handler = SagaTimeoutHandler::new(orchestrator, repository, registry, clock);
            let token = handler.shutdown_token();
            (handler.spawn(), token)
        }));
        self
    }

    /// Declare an in-memory-backed saga in one call.
    pub fn register_saga_in_memory<S: SagaState>(
        self,
        definition: StateMachineDefinition<S>,
        events: &[&str],
    ) -> Self {
        let repository: Arc<dyn SagaRepository<S>> = Arc::new(InMemorySagaRepository::<S>::new());
        self.register_saga(definition, repository, events)
    }

    pub fn with_saga_timeout_options(
        self,
        saga_type: impl Into<String>,
        options: SagaTimeoutOptions,
    ) -> Self {
        self.timeout_registry.register(saga_type, options);
        self
    }

    // Storage wiring; anything not supplied falls back to in-memory.

    pub fn with_outbox_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox_store = Some(store);
        self
    }

    pub fn with_inbox_store(mut self, store: Arc<dyn InboxStore>) -> Self {
        self.inbox_store = Some(store);
        self
    }

    pub fn with_dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency_store = Some(store);
        self
    }

    // Pipeline decorators.

    pub fn without_validation(mut self) -> Self {
        self.enable_validation = false;
        self
    }

    pub fn with_idempotency(mut self) -> Self {
        self.enable_idempotency = true;
        self
    }

    pub fn with_batching(mut self) -> Self {
        self.enable_batching = true;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.enable_retry = false;
        self
    }

    pub fn with_circuit_breaker(mut self) -> Self {
        self.enable_circuit_breaker = true;
        self
    }

    pub fn with_transaction(mut self, factory: Arc<dyn UnitOfWorkFactory>) -> Self {
        self.unit_of_work_factory = Some(factory);
        self
    }

    /// Validate the configuration and wire the runtime. Must run inside
    /// a tokio runtime; configuration errors abort with every reason
    /// enumerated.
    pub fn build(self) -> Result<Herald, HeraldError> {
        self.config.validate()?;

        let clock = self.clock;
        let outbox_store = self
            .outbox_store
            .unwrap_or_else(|| Arc::new(InMemoryOutboxStore::new(Arc::clone(&clock))));
        let inbox_store = self
            .inbox_store
            .unwrap_or_else(|| Arc::new(InMemoryInboxStore::new(Arc::clone(&clock))));
        let dead_letter_store = self
            .dead_letter_store
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new(Arc::clone(&clock))));
        let idempotency_store = self
            .idempotency_store
            .unwrap_or_else(|| Arc::new(InMemoryIdempotencyStore::new(Arc::clone(&clock))));

        // Dispatcher at the centre, decorators composed around it.
        let dispatcher =
            Arc::new(Dispatcher::new(Arc::clone(&self.registry)).with_event_mode(self.event_mode));
        let terminal = Arc::new(DispatchProcessor::new(Arc::clone(&dispatcher)));

        let mut pipeline_builder = PipelineBuilder::new(terminal);
        if self.enable_validation {
            pipeline_builder = pipeline_builder.with_validation();
        }
        if self.enable_idempotency {
            pipeline_builder = pipeline_builder
                .with_idempotency(Arc::clone(&idempotency_store), self.config.idempotency.clone());
        }
        if self.enable_batching {
            pipeline_builder = pipeline_builder.with_batching(self.config.batching.clone());
        }
        if self.enable_retry {
            pipeline_builder = pipeline_builder.with_retry(self.config.retry.clone());
        }
        if self.enable_circuit_breaker {
            pipeline_builder =
                pipeline_builder.with_circuit_breaker(self.config.circuit_breaker.clone());
        }
        if let Some(factory) = self.unit_of_work_factory {
            pipeline_builder =
                pipeline_builder.with_transaction(factory, self.config.transaction.isolation_level);
        }
        let pipeline = pipeline_builder.build()?;
        let root = pipeline.root();

        let outbox_processor = Arc::new(OutboxProcessor::new(
            self.config.outbox.clone(),
            Arc::clone(&outbox_store),
            Arc::clone(&dead_letter_store),
            Arc::clone(&root),
            Arc::clone(&clock),
        ));

        let inbox_processor = Arc::new(InboxProcessor::new(
            self.config.inbox.clone(),
            Arc::clone(&inbox_store),
            Arc::clone(&root),
            Arc::clone(&clock),
        ));

        let queues = Arc::new(QueueManager::new(
            self.config.queue.clone(),
            Arc::clone(&root),
            Arc::clone(&clock),
        ));

        // Scheduled messages route to a queue when the destination names
        // one, otherwise straight through the pipeline.
        let delivery: Arc<dyn DeliveryHandler> = Arc::new(BusDeliveryHandler {
            processor: Arc::clone(&root),
            queues: Arc::clone(&queues),
            clock: Arc::clone(&clock),
        });
        let scheduler = Arc::new(InMemoryScheduler::new(delivery, Arc::clone(&clock)));

        Ok(Herald::assemble(crate::bus::HeraldParts {
            config: self.config,
            clock,
            registry: self.registry,
            pipeline,
            root,
            outbox_store,
            inbox_store,
            dead_letter_store,
            idempotency_store,
            outbox_processor,
            inbox_processor,
            scheduler,
            queues,
            saga_workers: self.saga_workers,
        }))
    }
}

impl Default for HeraldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery callback used by the built-in scheduler.
struct BusDeliveryHandler {
    processor: Arc<dyn herald_pipeline::Processor>,
    queues: Arc<QueueManager>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl DeliveryHandler for BusDeliveryHandler {
    async fn deliver(
        &self,
        scheduled: &herald_common::ScheduledMessage,
    ) -> Result<(), HeraldError> {
        if self.queues.queue_names().iter().any(|name| name == &scheduled.destination) {
            self.queues
                .enqueue(
                    &scheduled.destination,
                    scheduled.message.clone(),
                    herald_common::EnqueueOptions::default(),
                )
                .await?;
            return Ok(());
        }

        let ctx = ProcessContext::for_envelope(&scheduled.message, Arc::clone(&self.clock));
        match self.processor.process(&scheduled.message, &ctx).await {
            Outcome::Failure(failure) => Err(HeraldError::Scheduler(failure.to_string())),
            _ => Ok(()),
        }
    }
}

pub(crate) fn spawn_idempotency_sweeper(
    store: Arc<dyn IdempotencyStore>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_sweeper(store, std::time::Duration::from_secs(60), shutdown)
}
