//! Idempotency decorator
//!
//! Derives a cache key for each message, returns a cached outcome on a
//! fresh hit without invoking the inner processor, and caches the inner
//! outcome on a miss. Success outcomes are stored for `success_ttl`;
//! failures for `failure_ttl` only when `cache_failures` is set. Skipped
//! outcomes are never cached.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use herald_common::config::IdempotencyConfig;
use herald_common::{Envelope, IdempotencyOutcome, Outcome, ProcessingFailure};
use herald_storage::IdempotencyStore;

use crate::processor::{ProcessContext, Processor};

/// Derives the idempotency key for an envelope. The default keys on the
/// MessageId; producers with their own natural keys plug in here.
pub trait IdempotencyKeyGenerator: Send + Sync {
    fn key(&self, envelope: &Envelope) -> String;
}

/// Default generator: the message id itself.
pub struct MessageIdKeyGenerator;

impl IdempotencyKeyGenerator for MessageIdKeyGenerator {
    fn key(&self, envelope: &Envelope) -> String {
        envelope.id.to_string()
    }
}

pub struct IdempotencyDecorator {
    store: Arc<dyn IdempotencyStore>,
    generator: Arc<dyn IdempotencyKeyGenerator>,
    config: IdempotencyConfig,
    inner: Arc<dyn Processor>,
}

impl IdempotencyDecorator {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        config: IdempotencyConfig,
        inner: Arc<dyn Processor>,
    ) -> Self {
        Self { store, generator: Arc::new(MessageIdKeyGenerator), config, inner }
    }

    pub fn with_key_generator(mut self, generator: Arc<dyn IdempotencyKeyGenerator>) -> Self {
        self.generator = generator;
        self
    }

    fn cached_outcome(record: herald_common::IdempotencyRecord) -> Option<Outcome> {
        match record.outcome {
            IdempotencyOutcome::Success => {
                serde_json::from_value::<Option<serde_json::Value>>(record.result)
                    .ok()
                    .map(Outcome::Success)
            }
            IdempotencyOutcome::Failure => {
                serde_json::from_value::<ProcessingFailure>(record.result)
                    .ok()
                    .map(Outcome::Failure)
            }
        }
    }
}

#[async_trait]
impl Processor for IdempotencyDecorator {
    async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        if let Some(failure) = ctx.interruption() {
            return Outcome::Failure(failure);
        }

        let key = self.generator.key(envelope);

        match self.store.get(&key).await {
            Ok(Some(record)) => {
                if let Some(outcome) = Self::cached_outcome(record) {
                    debug!(message_id = %envelope.id, key = %key, "Idempotency cache hit");
                    return outcome;
                }
                // An undecodable record is treated as a miss.
                warn!(key = %key, "Discarding undecodable idempotency record");
            }
            Ok(None) => {}
            Err(e) => {
                // A failing cache must not block processing.
                warn!(key = %key, error = %e, "Idempotency lookup failed, invoking inner");
            }
        }

        let outcome = self.inner.process(envelope, ctx).await;

        let stored = match &outcome {
            Outcome::Success(result) => {
                let blob = serde_json::to_value(result).unwrap_or(serde_json::Value::Null);
                self.store.store_success(&key, blob, self.config.success_ttl).await
            }
            Outcome::Failure(failure) if self.config.cache_failures => {
                match serde_json::to_value(failure) {
                    Ok(blob) => self.store.store_failure(&key, blob, self.config.failure_ttl).await,
                    Err(e) => Err(herald_storage::StorageError::Serialization(e)),
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = stored {
            warn!(key = %key, error = %e, "Failed to record idempotency outcome");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::FnProcessor;
    use herald_common::{system_clock, ErrorKind, ManualClock, MessageId, MessageKind};
    use herald_storage::InMemoryIdempotencyStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counting_inner(counter: Arc<AtomicU32>, outcome: Outcome) -> Arc<dyn Processor> {
        Arc::new(FnProcessor::new(move |_| {
            let counter = Arc::clone(&counter);
            let outcome = outcome.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                outcome
            }
        }))
    }

    fn envelope() -> Envelope {
        Envelope::from_parts(MessageId::new(), MessageKind::Command, "c", serde_json::json!({}))
    }

    #[tokio::test]
    async fn second_invocation_served_from_cache() {
        let store = Arc::new(InMemoryIdempotencyStore::new(system_clock()));
        let calls = Arc::new(AtomicU32::new(0));
        let decorator = IdempotencyDecorator::new(
            store,
            IdempotencyConfig::default(),
            counting_inner(Arc::clone(&calls), Outcome::success_with(serde_json::json!(7))),
        );

        let message = envelope();
        let ctx = ProcessContext::new();
        let first = decorator.process(&message, &ctx).await;
        let second = decorator.process(&message, &ctx).await;

        assert_eq!(first.result(), Some(&serde_json::json!(7)));
        assert_eq!(second.result(), Some(&serde_json::json!(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_not_cached_by_default() {
        let store = Arc::new(InMemoryIdempotencyStore::new(system_clock()));
        let calls = Arc::new(AtomicU32::new(0));
        let decorator = IdempotencyDecorator::new(
            store,
            IdempotencyConfig::default(),
            counting_inner(
                Arc::clone(&calls),
                Outcome::failure(ErrorKind::Permanent, "rejected"),
            ),
        );

        let message = envelope();
        let ctx = ProcessContext::new();
        decorator.process(&message, &ctx).await;
        decorator.process(&message, &ctx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_failure_returned_when_enabled() {
        let store = Arc::new(InMemoryIdempotencyStore::new(system_clock()));
        let calls = Arc::new(AtomicU32::new(0));
        let config = IdempotencyConfig { cache_failures: true, ..Default::default() };
        let decorator = IdempotencyDecorator::new(
            store,
            config,
            counting_inner(
                Arc::clone(&calls),
                Outcome::failure(ErrorKind::Permanent, "rejected"),
            ),
        );

        let message = envelope();
        let ctx = ProcessContext::new();
        decorator.process(&message, &ctx).await;
        let second = decorator.process(&message, &ctx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.failure_kind(), Some(ErrorKind::Permanent));
    }

    #[tokio::test]
    async fn expired_cache_entry_invokes_inner_again() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryIdempotencyStore::new(clock.clone()));
        let calls = Arc::new(AtomicU32::new(0));
        let config = IdempotencyConfig {
            success_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let decorator = IdempotencyDecorator::new(
            store,
            config,
            counting_inner(Arc::clone(&calls), Outcome::success()),
        );

        let message = envelope();
        let ctx = ProcessContext::with_clock(clock.clone());
        decorator.process(&message, &ctx).await;
        clock.advance(Duration::from_secs(61));
        decorator.process(&message, &ctx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
