//! Processor trait and processing context
//!
//! A processor turns one envelope into one outcome. Decorators are
//! processors wrapping an inner processor; the composed chain is built
//! once by the [`crate::PipelineBuilder`] and immutable afterwards.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use herald_common::{system_clock, Clock, Envelope, Outcome, ProcessingFailure};

/// One processing step. Outer decorators observe inner outcomes and may
/// transform them.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome;
}

/// Per-dispatch context handed down the decorator chain.
///
/// Cloning is cheap and shares the scoped state map, so a decorator
/// that re-dispatches (batching) hands the same scope to the inner
/// frames. A decorator that mutates scope state must restore it on
/// exit.
#[derive(Clone)]
pub struct ProcessContext {
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    cancellation: CancellationToken,
    deadline: Option<DateTime<Utc>>,
    scope: Arc<DashMap<String, serde_json::Value>>,
    clock: Arc<dyn Clock>,
}

impl ProcessContext {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            correlation_id: None,
            causation_id: None,
            cancellation: CancellationToken::new(),
            deadline: None,
            scope: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Derive the context for dispatching `envelope`, adopting its
    /// correlation chain.
    pub fn for_envelope(envelope: &Envelope, clock: Arc<dyn Clock>) -> Self {
        let mut ctx = Self::with_clock(clock);
        ctx.correlation_id = envelope.correlation_id.clone();
        ctx.causation_id = envelope.causation_id.clone();
        ctx
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn deadline_expired(&self) -> bool {
        self.deadline.map_or(false, |deadline| self.clock.now() >= deadline)
    }

    /// Failure to return when a suspension point observes cancellation
    /// or an expired deadline; None when neither fired.
    pub fn interruption(&self) -> Option<ProcessingFailure> {
        if self.is_cancelled() {
            return Some(ProcessingFailure::cancelled());
        }
        if self.deadline_expired() {
            return Some(ProcessingFailure::timeout("processing deadline elapsed"));
        }
        None
    }

    // Scoped decorator-local state.

    pub fn scope_set(&self, key: &str, value: serde_json::Value) -> Option<serde_json::Value> {
        self.scope.insert(key.to_string(), value)
    }

    pub fn scope_get(&self, key: &str) -> Option<serde_json::Value> {
        self.scope.get(key).map(|value| value.clone())
    }

    pub fn scope_remove(&self, key: &str) -> Option<serde_json::Value> {
        self.scope.remove(key).map(|(_, value)| value)
    }

    pub fn scope_contains(&self, key: &str) -> bool {
        self.scope.contains_key(key)
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

type BoxedProcessFn =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = Outcome> + Send>> + Send + Sync>;

/// Closure-backed processor, mostly for tests and small terminal steps.
pub struct FnProcessor {
    function: BoxedProcessFn,
}

impl FnProcessor {
    pub fn new<F, Fut>(function: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Self { function: Arc::new(move |envelope| Box::pin(function(envelope))) }
    }
}

#[async_trait]
impl Processor for FnProcessor {
    async fn process(&self, envelope: &Envelope, _ctx: &ProcessContext) -> Outcome {
        (self.function)(envelope.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::{ManualClock, MessageId, MessageKind};
    use std::time::Duration;

    #[tokio::test]
    async fn interruption_reports_cancellation_first() {
        let ctx = ProcessContext::new();
        assert!(ctx.interruption().is_none());
        ctx.cancellation().cancel();
        let failure = ctx.interruption().unwrap();
        assert_eq!(failure.kind, herald_common::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn deadline_expiry_observed_via_clock() {
        let clock = Arc::new(ManualClock::starting_now());
        let deadline = clock.now() + chrono::Duration::seconds(5);
        let ctx = ProcessContext::with_clock(clock.clone()).with_deadline(deadline);
        assert!(!ctx.deadline_expired());
        clock.advance(Duration::from_secs(6));
        assert!(ctx.deadline_expired());
        assert_eq!(ctx.interruption().unwrap().kind, herald_common::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn scope_is_shared_across_clones() {
        let ctx = ProcessContext::new();
        let cloned = ctx.clone();
        ctx.scope_set("k", serde_json::json!(1));
        assert_eq!(cloned.scope_get("k"), Some(serde_json::json!(1)));
        cloned.scope_remove("k");
        assert!(!ctx.scope_contains("k"));
    }

    #[tokio::test]
    async fn fn_processor_runs_closure() {
        let processor = FnProcessor::new(|envelope: Envelope| async move {
            Outcome::success_with(serde_json::json!(envelope.message_type))
        });
        let envelope = Envelope::from_parts(
            MessageId::new(),
            MessageKind::Command,
            "c",
            serde_json::json!({}),
        );
        let outcome = processor.process(&envelope, &ProcessContext::new()).await;
        assert_eq!(outcome.result(), Some(&serde_json::json!("c")));
    }
}
