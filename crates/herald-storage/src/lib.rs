//! Storage contracts, in-memory reference adapters, the idempotency
//! store, and the resilience layer shared by storage adapters.

pub mod contracts;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod resilience;
pub mod resilient;

pub use contracts::{
    DeadLetterStore, InboxStore, MessageFilter, MessageStore, OutboxStore, QueueStore,
    SagaRepository, ScheduledMessageStore, StoreOptions,
};
pub use error::{StorageError, StorageResult};
pub use idempotency::{spawn_sweeper, IdempotencyStore, InMemoryIdempotencyStore};
pub use memory::{
    InMemoryDeadLetterStore, InMemoryInboxStore, InMemoryMessageStore, InMemoryOutboxStore,
    InMemoryQueueStore, InMemorySagaRepository, InMemoryScheduledMessageStore,
};
pub use resilience::{CircuitState, ConnectionResilience, ResilienceCircuit, RetryPolicy};
pub use resilient::{ResilientInboxStore, ResilientOutboxStore, ResilientScheduledMessageStore};
