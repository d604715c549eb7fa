//! Saga timeout handling
//!
//! A per-saga-type options registry and a polling worker that scans the
//! repository for incomplete sagas whose timeout has passed, delivers a
//! synthetic timeout event to the orchestrator, and clears the timeout
//! so it does not re-fire. Per-type registry entries take precedence
//! over the global defaults.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use herald_common::{Clock, Envelope, MessageId, MessageKind, SagaState};
use herald_storage::SagaRepository;

use crate::orchestrator::SagaOrchestrator;

/// Default type tag for synthetic timeout events.
pub const DEFAULT_TIMEOUT_EVENT: &str = "saga.timeout";

#[derive(Debug, Clone)]
pub struct SagaTimeoutOptions {
    /// Type tag of the synthetic event delivered on expiry.
    pub timeout_event: String,
    pub polling_interval: Duration,
}

impl Default for SagaTimeoutOptions {
    fn default() -> Self {
        Self {
            timeout_event: DEFAULT_TIMEOUT_EVENT.to_string(),
            polling_interval: Duration::from_secs(1),
        }
    }
}

/// Options registry keyed by saga type tag; per-type entries win over
/// the defaults.
#[derive(Default)]
pub struct SagaTimeoutRegistry {
    defaults: SagaTimeoutOptions,
    per_type: DashMap<String, SagaTimeoutOptions>,
}

impl SagaTimeoutRegistry {
    pub fn new(defaults: SagaTimeoutOptions) -> Self {
        Self { defaults, per_type: DashMap::new() }
    }

    pub fn register(&self, saga_type: impl Into<String>, options: SagaTimeoutOptions) {
        self.per_type.insert(saga_type.into(), options);
    }

    pub fn options_for(&self, saga_type: &str) -> SagaTimeoutOptions {
        self.per_type
            .get(saga_type)
            .map(|options| options.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }
}

/// Polling worker for one saga type.
pub struct SagaTimeoutHandler<S: SagaState> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    repository: Arc<dyn SagaRepository<S>>,
    registry: Arc<SagaTimeoutRegistry>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl<S: SagaState> SagaTimeoutHandler<S> {
    pub fn new(
        orchestrator: Arc<SagaOrchestrator<S>>,
        repository: Arc<dyn SagaRepository<S>>,
        registry: Arc<SagaTimeoutRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { orchestrator, repository, registry, clock, shutdown: CancellationToken::new() }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let options = self.registry.options_for(S::saga_type());
        info!(
            saga_type = S::saga_type(),
            timeout_event = %options.timeout_event,
            polling_interval_ms = options.polling_interval.as_millis() as u64,
            "Starting saga timeout handler"
        );
        let mut ticker =
            tokio::time::interval(options.polling_interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.deliver_expired(&options).await;
                }
            }
        }
    }

    /// One poll pass, factored out for tests.
    pub async fn deliver_expired(&self, options: &SagaTimeoutOptions) {
        let now = self.clock.now();
        let expired = match self.repository.get_expired(now).await {
            Ok(expired) => expired,
            Err(e) => {
                warn!(saga_type = S::saga_type(), error = %e, "Timeout scan failed");
                return;
            }
        };

        for saga in expired {
            debug!(
                saga_type = S::saga_type(),
                correlation_id = %saga.correlation_id,
                "Delivering saga timeout"
            );
            metrics::counter!("herald.saga.timeouts_total").increment(1);

            let envelope = Envelope::from_parts(
                MessageId::new(),
                MessageKind::Event,
                options.timeout_event.clone(),
                serde_json::json!({ "sagaType": S::saga_type() }),
            )
            .with_correlation_id(saga.correlation_id.clone());

            let _ = self.orchestrator.handle_event(&envelope).await;

            // Clear the timeout if the transition did not already move
            // it, so the same expiry never fires twice.
            match self.repository.load(&saga.correlation_id).await {
                Ok(Some(mut current)) => {
                    if current.timeout_at.map_or(false, |at| at <= now) {
                        let version = current.version;
                        current.timeout_at = None;
                        current.updated_at = now;
                        if let Err(e) = self.repository.save(&current, version).await {
                            warn!(
                                correlation_id = %saga.correlation_id,
                                error = %e,
                                "Failed to clear saga timeout"
                            );
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(correlation_id = %saga.correlation_id, error = %e, "Reload after timeout failed");
                }
            }
        }
    }
}
