//! Message handler trait
//!
//! Handlers receive the envelope and the processing context and return
//! an outcome. Registration is by exact type tag; there is no
//! inheritance-based dispatch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use herald_common::{Envelope, Outcome};
use herald_pipeline::ProcessContext;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome;
}

type BoxedHandlerFn =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = Outcome> + Send>> + Send + Sync>;

/// Closure-backed handler for simple consumers and tests.
pub struct FnHandler {
    function: BoxedHandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(function: F) -> Arc<Self>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Arc::new(Self { function: Arc::new(move |envelope| Box::pin(function(envelope))) })
    }
}

#[async_trait]
impl MessageHandler for FnHandler {
    async fn handle(&self, envelope: &Envelope, _ctx: &ProcessContext) -> Outcome {
        (self.function)(envelope.clone()).await
    }
}
