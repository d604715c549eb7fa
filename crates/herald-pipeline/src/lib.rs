//! The message processing pipeline: a composable chain of decorators
//! (validation, idempotency, batching, retry, circuit breaker,
//! transactional scope) wrapping each handler invocation.

pub mod batch;
pub mod builder;
pub mod circuit_breaker;
pub mod idempotency;
pub mod processor;
pub mod retry;
pub mod transaction;
pub mod validation;

pub use batch::{BatchDecorator, BatchKeyGenerator, TypeTagBatchKey};
pub use builder::{Pipeline, PipelineBuilder};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerDecorator, CircuitState};
pub use idempotency::{IdempotencyDecorator, IdempotencyKeyGenerator, MessageIdKeyGenerator};
pub use processor::{FnProcessor, ProcessContext, Processor};
pub use retry::RetryDecorator;
pub use transaction::{
    NoopUnitOfWork, NoopUnitOfWorkFactory, TransactionDecorator, UnitOfWork, UnitOfWorkFactory,
};
pub use validation::{FnValidator, MessageValidator, ValidationDecorator};
