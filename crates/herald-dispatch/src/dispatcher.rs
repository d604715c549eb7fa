//! Dispatcher
//!
//! Routes an envelope to its handler(s) by exact type tag. Commands and
//! queries go to a single handler; events fan out to every subscriber,
//! concurrently by default or sequentially in registration order.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use herald_common::{Envelope, ErrorKind, MessageKind, Outcome, ProcessingFailure};
use herald_pipeline::{ProcessContext, Processor};

use crate::registry::HandlerRegistry;

/// How event handlers are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDispatchMode {
    /// All handlers concurrently; the first failure does not cancel the
    /// others and the aggregate is Success iff all succeeded.
    Parallel,
    /// Registration order. With `stop_on_failure`, the remaining
    /// handlers are skipped after the first failure.
    Sequential { stop_on_failure: bool },
}

impl Default for EventDispatchMode {
    fn default() -> Self {
        EventDispatchMode::Parallel
    }
}

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    event_mode: EventDispatchMode,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry, event_mode: EventDispatchMode::default() }
    }

    pub fn with_event_mode(mut self, event_mode: EventDispatchMode) -> Self {
        self.event_mode = event_mode;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub async fn dispatch(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        if let Some(failure) = ctx.interruption() {
            return Outcome::Failure(failure);
        }
        match envelope.kind {
            MessageKind::Command => self.dispatch_command(envelope, ctx).await,
            MessageKind::Query => self.dispatch_query(envelope, ctx).await,
            MessageKind::Event => self.dispatch_event(envelope, ctx).await,
        }
    }

    async fn dispatch_command(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        match self.registry.command_handler(&envelope.message_type) {
            Some(handler) => handler.handle(envelope, ctx).await,
            None => Outcome::Failure(ProcessingFailure::no_handler(&envelope.message_type)),
        }
    }

    async fn dispatch_query(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        let Some(handler) = self.registry.query_handler(&envelope.message_type) else {
            return Outcome::Failure(ProcessingFailure::no_handler(&envelope.message_type));
        };
        match handler.handle(envelope, ctx).await {
            Outcome::Success(None) => {
                warn!(
                    message_type = %envelope.message_type,
                    "Query handler returned no result"
                );
                Outcome::Failure(ProcessingFailure::new(
                    ErrorKind::Permanent,
                    format!("query handler for '{}' produced no result", envelope.message_type),
                ))
            }
            outcome => outcome,
        }
    }

    async fn dispatch_event(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        let handlers = self.registry.event_handlers(&envelope.message_type);
        if handlers.is_empty() {
            debug!(
                message_type = %envelope.message_type,
                "No subscribers for event"
            );
            return Outcome::success();
        }

        match self.event_mode {
            EventDispatchMode::Parallel => {
                let invocations = handlers
                    .iter()
                    .map(|handler| handler.handle(envelope, ctx));
                let outcomes = join_all(invocations).await;
                let failures: Vec<ProcessingFailure> = outcomes
                    .into_iter()
                    .filter_map(|outcome| match outcome {
                        Outcome::Failure(failure) => Some(failure),
                        _ => None,
                    })
                    .collect();
                if failures.is_empty() {
                    Outcome::success()
                } else {
                    Outcome::Failure(ProcessingFailure::aggregate(failures))
                }
            }
            EventDispatchMode::Sequential { stop_on_failure } => {
                let mut failures = Vec::new();
                for handler in handlers {
                    if let Outcome::Failure(failure) = handler.handle(envelope, ctx).await {
                        failures.push(failure);
                        if stop_on_failure {
                            break;
                        }
                    }
                }
                if failures.is_empty() {
                    Outcome::success()
                } else {
                    Outcome::Failure(ProcessingFailure::aggregate(failures))
                }
            }
        }
    }
}

/// Terminal pipeline step invoking the dispatcher; the innermost
/// processor of every composed chain.
pub struct DispatchProcessor {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchProcessor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Processor for DispatchProcessor {
    async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        self.dispatcher.dispatch(envelope, ctx).await
    }
}
