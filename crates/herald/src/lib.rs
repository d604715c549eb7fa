//! Herald: an in-process reliable-messaging runtime.
//!
//! Mediator command/query dispatch, a multi-handler event bus,
//! transactional outbox and deduplicating inbox processors, in-memory
//! queue transports (channel and ring buffer), saga orchestration,
//! delayed scheduling, and a composable processing pipeline
//! (validation, idempotency, batching, retry, circuit breaking,
//! transactional scope) wrapping every handler invocation.
//!
//! Wiring is explicit: register handlers on a [`HeraldBuilder`], pick
//! storage adapters (in-memory by default), and `build()` a fully-wired
//! [`Herald`].
//!
//! ```rust,ignore
//! let mut bus = HeraldBuilder::new()
//!     .register_command("orders.place", place_order_handler)
//!     .subscribe("orders.placed", notify_warehouse)
//!     .with_idempotency()
//!     .build()?;
//! bus.start();
//!
//! let outcome = bus.send(&PlaceOrder { order_id }).await;
//! ```

pub mod builder;
pub mod bus;
pub mod queues;

pub use builder::HeraldBuilder;
pub use bus::Herald;
pub use queues::QueueManager;

// The pieces applications touch directly.
pub use herald_common::{
    Clock, EnqueueOptions, Envelope, ErrorKind, HeraldConfig, HeraldError, InboxOptions,
    ManualClock, MessageId, MessageKind, MessagePayload, Outcome, OutboxPublishOptions, Priority,
    ProcessingFailure, SagaInstance, SagaState, SystemClock,
};
pub use herald_dispatch::{EventDispatchMode, FnHandler, MessageHandler};
pub use herald_inbox::InboxOutcome;
pub use herald_pipeline::{ProcessContext, Processor, UnitOfWork, UnitOfWorkFactory};
pub use herald_saga::{SagaTimeoutOptions, StateMachineDefinition};
pub use herald_scheduler::{DeliveryHandler, ScheduleOptions, Scheduler};
