//! In-memory reference adapters
//!
//! Concurrent-map implementations of every storage contract. These back
//! the default wiring and the test suites; durable adapters live in
//! external packages implementing the same contracts.

mod dead_letter;
mod inbox;
mod message;
mod outbox;
mod queue;
mod saga;
mod scheduled;

pub use dead_letter::InMemoryDeadLetterStore;
pub use inbox::InMemoryInboxStore;
pub use message::InMemoryMessageStore;
pub use outbox::InMemoryOutboxStore;
pub use queue::InMemoryQueueStore;
pub use saga::InMemorySagaRepository;
pub use scheduled::InMemoryScheduledMessageStore;
