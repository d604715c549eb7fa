//! Handler registry
//!
//! Populated at startup by explicit registration calls; immutable-by
//! convention afterwards. Commands and queries take exactly one handler
//! per type tag, events take any number in registration order.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::handler::MessageHandler;

#[derive(Default)]
pub struct HandlerRegistry {
    commands: DashMap<String, Arc<dyn MessageHandler>>,
    queries: DashMap<String, Arc<dyn MessageHandler>>,
    events: DashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the command handler for a type tag. A repeated
    /// registration replaces the previous handler.
    pub fn register_command(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let message_type = message_type.into();
        if self.commands.insert(message_type.clone(), handler).is_some() {
            warn!(message_type = %message_type, "Replacing existing command handler");
        }
    }

    /// Register the query handler for a type tag. Query handlers must
    /// produce a result; a Success without one is reported as a failure
    /// at dispatch time.
    pub fn register_query(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let message_type = message_type.into();
        if self.queries.insert(message_type.clone(), handler).is_some() {
            warn!(message_type = %message_type, "Replacing existing query handler");
        }
    }

    /// Subscribe an event handler. Handlers accumulate in registration
    /// order.
    pub fn subscribe(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.events.entry(message_type.into()).or_default().push(handler);
    }

    pub fn command_handler(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.commands.get(message_type).map(|handler| Arc::clone(&handler))
    }

    pub fn query_handler(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.queries.get(message_type).map(|handler| Arc::clone(&handler))
    }

    pub fn event_handlers(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.events
            .get(message_type)
            .map(|handlers| handlers.clone())
            .unwrap_or_default()
    }

    pub fn handler_count(&self) -> usize {
        self.commands.len()
            + self.queries.len()
            + self.events.iter().map(|handlers| handlers.len()).sum::<usize>()
    }
}
