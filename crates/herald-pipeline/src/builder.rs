//! Pipeline builder
//!
//! Composes the enabled decorators around a terminal processor in the
//! canonical order (outermost first): Validation, Idempotency, Batch,
//! Retry, CircuitBreaker, Transaction. Decorators are individually
//! optional but never reordered; the chain is immutable after build.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use herald_common::config::{
    BatchingConfig, CircuitBreakerConfig, IdempotencyConfig, RetryConfig,
};
use herald_common::{Envelope, HeraldError, IsolationLevel, Outcome};
use herald_storage::IdempotencyStore;

use crate::batch::{BatchDecorator, BatchKeyGenerator};
use crate::circuit_breaker::CircuitBreakerDecorator;
use crate::idempotency::{IdempotencyDecorator, IdempotencyKeyGenerator};
use crate::processor::{ProcessContext, Processor};
use crate::retry::RetryDecorator;
use crate::transaction::{TransactionDecorator, UnitOfWorkFactory};
use crate::validation::{MessageValidator, ValidationDecorator};

/// The composed chain plus the background tasks it owns.
pub struct Pipeline {
    root: Arc<dyn Processor>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: Vec<CancellationToken>,
}

impl Pipeline {
    pub async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        self.root.process(envelope, ctx).await
    }

    pub fn root(&self) -> Arc<dyn Processor> {
        Arc::clone(&self.root)
    }

    /// Stop the pipeline's background tasks, flushing pending batches.
    pub async fn shutdown(self) {
        for token in &self.shutdown {
            token.cancel();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct PipelineBuilder {
    terminal: Arc<dyn Processor>,
    validators: Vec<(String, Arc<dyn MessageValidator>)>,
    validation_enabled: bool,
    idempotency: Option<(Arc<dyn IdempotencyStore>, IdempotencyConfig)>,
    idempotency_keys: Option<Arc<dyn IdempotencyKeyGenerator>>,
    batching: Option<BatchingConfig>,
    batch_keys: Option<Arc<dyn BatchKeyGenerator>>,
    retry: Option<RetryConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    transaction: Option<(Arc<dyn UnitOfWorkFactory>, IsolationLevel)>,
}

impl PipelineBuilder {
    /// Start a builder around the terminal processor (normally the
    /// dispatcher's handler invoker).
    pub fn new(terminal: Arc<dyn Processor>) -> Self {
        Self {
            terminal,
            validators: Vec::new(),
            validation_enabled: false,
            idempotency: None,
            idempotency_keys: None,
            batching: None,
            batch_keys: None,
            retry: None,
            circuit_breaker: None,
            transaction: None,
        }
    }

    pub fn with_validation(mut self) -> Self {
        self.validation_enabled = true;
        self
    }

    pub fn with_validator(
        mut self,
        message_type: impl Into<String>,
        validator: Arc<dyn MessageValidator>,
    ) -> Self {
        self.validation_enabled = true;
        self.validators.push((message_type.into(), validator));
        self
    }

    pub fn with_idempotency(
        mut self,
        store: Arc<dyn IdempotencyStore>,
        config: IdempotencyConfig,
    ) -> Self {
        self.idempotency = Some((store, config));
        self
    }

    pub fn with_idempotency_key_generator(
        mut self,
        generator: Arc<dyn IdempotencyKeyGenerator>,
    ) -> Self {
        self.idempotency_keys = Some(generator);
        self
    }

    pub fn with_batching(mut self, config: BatchingConfig) -> Self {
        self.batching = Some(config);
        self
    }

    pub fn with_batch_key_generator(mut self, generator: Arc<dyn BatchKeyGenerator>) -> Self {
        self.batch_keys = Some(generator);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_transaction(
        mut self,
        factory: Arc<dyn UnitOfWorkFactory>,
        isolation: IsolationLevel,
    ) -> Self {
        self.transaction = Some((factory, isolation));
        self
    }

    /// Compose the chain. Must run inside a tokio runtime when batching
    /// is enabled (the batch flush timer is spawned here).
    pub fn build(self) -> Result<Pipeline, HeraldError> {
        self.validate()?;

        let mut chain: Arc<dyn Processor> = self.terminal;
        let mut tasks = Vec::new();
        let mut shutdown = Vec::new();

        // Innermost first; the loop below is the canonical order read
        // bottom-up.
        if let Some((factory, isolation)) = self.transaction {
            chain = Arc::new(TransactionDecorator::new(factory, isolation, chain));
        }
        if let Some(config) = self.circuit_breaker {
            chain = Arc::new(CircuitBreakerDecorator::new(config, chain));
        }
        if let Some(config) = self.retry {
            chain = Arc::new(RetryDecorator::new(config, chain));
        }
        if let Some(config) = self.batching {
            let mut decorator = BatchDecorator::new(config, chain);
            if let Some(keys) = self.batch_keys {
                decorator = decorator.with_key_generator(keys);
            }
            shutdown.push(decorator.shutdown_token());
            tasks.push(decorator.spawn_flush_task());
            chain = Arc::new(decorator);
        }
        if let Some((store, config)) = self.idempotency {
            let mut decorator = IdempotencyDecorator::new(store, config, chain);
            if let Some(keys) = self.idempotency_keys {
                decorator = decorator.with_key_generator(keys);
            }
            chain = Arc::new(decorator);
        }
        if self.validation_enabled {
            let mut decorator = ValidationDecorator::new(chain);
            for (message_type, validator) in self.validators {
                decorator = decorator.with_validator(message_type, validator);
            }
            chain = Arc::new(decorator);
        }

        Ok(Pipeline { root: chain, tasks, shutdown })
    }

    fn validate(&self) -> Result<(), HeraldError> {
        let mut reasons = Vec::new();
        if let Some(config) = &self.batching {
            if config.max_batch_size == 0 {
                reasons.push("batching.max_batch_size must be greater than zero".to_string());
            }
            if config.batch_timeout.is_zero() {
                reasons.push("batching.batch_timeout must be greater than zero".to_string());
            }
            if config.max_degree_of_parallelism == 0 {
                reasons
                    .push("batching.max_degree_of_parallelism must be greater than zero".to_string());
            }
        }
        if let Some(config) = &self.circuit_breaker {
            if config.failure_threshold == 0 {
                reasons.push("circuit_breaker.failure_threshold must be greater than zero".to_string());
            }
        }
        if let Some(config) = &self.retry {
            if config.base_delay.is_zero() {
                reasons.push("retry.base_delay must be greater than zero".to_string());
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(HeraldError::Configuration(reasons.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::FnProcessor;
    use herald_common::{system_clock, ErrorKind, MessageId, MessageKind};
    use herald_storage::InMemoryIdempotencyStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn terminal(calls: Arc<AtomicU32>) -> Arc<dyn Processor> {
        Arc::new(FnProcessor::new(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Outcome::success()
            }
        }))
    }

    fn envelope() -> Envelope {
        Envelope::from_parts(MessageId::new(), MessageKind::Command, "c", serde_json::json!({}))
    }

    #[tokio::test]
    async fn bare_pipeline_is_just_the_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = PipelineBuilder::new(terminal(Arc::clone(&calls))).build().unwrap();
        assert!(pipeline.process(&envelope(), &ProcessContext::new()).await.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_chain_processes_and_caches() {
        let calls = Arc::new(AtomicU32::new(0));
        let store = Arc::new(InMemoryIdempotencyStore::new(system_clock()));
        let pipeline = PipelineBuilder::new(terminal(Arc::clone(&calls)))
            .with_validation()
            .with_idempotency(store, IdempotencyConfig::default())
            .with_retry(RetryConfig {
                base_delay: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            })
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .build()
            .unwrap();

        let message = envelope();
        let ctx = ProcessContext::new();
        assert!(pipeline.process(&message, &ctx).await.is_success());
        assert!(pipeline.process(&message, &ctx).await.is_success());
        // Second call answered by the idempotency cache.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_batching_config_rejected_at_build() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = PipelineBuilder::new(terminal(calls))
            .with_batching(BatchingConfig { max_batch_size: 0, ..Default::default() })
            .build();
        assert!(matches!(result, Err(HeraldError::Configuration(_))));
    }

    #[tokio::test]
    async fn validation_rejects_before_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let pipeline = PipelineBuilder::new(terminal(Arc::clone(&calls)))
            .with_validation()
            .build()
            .unwrap();
        let mut bad = envelope();
        bad.message_type = "".into();
        let outcome = pipeline.process(&bad, &ProcessContext::new()).await;
        assert_eq!(outcome.failure_kind(), Some(ErrorKind::Validation));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
