//! Saga orchestration: per-instance state machines with optimistic
//! concurrency, timeout detection, and compensation transitions.

pub mod definition;
pub mod orchestrator;
pub mod timeout;

pub use definition::{
    Binding, BindingBuilder, Evaluation, SagaEffect, StateMachineDefinition, COMPENSATING_STATE,
};
pub use orchestrator::{SagaOrchestrator, SagaTimeoutSink};
pub use timeout::{
    SagaTimeoutHandler, SagaTimeoutOptions, SagaTimeoutRegistry, DEFAULT_TIMEOUT_EVENT,
};
