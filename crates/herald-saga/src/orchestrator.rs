//! Saga orchestrator
//!
//! Executes the state machine for one saga type: load (or create, when
//! the event is the initial trigger), evaluate, and persist with an
//! optimistic version check. A lost save race reloads and re-evaluates
//! up to a bounded number of attempts before reporting a concurrency
//! failure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use herald_common::{Clock, Envelope, ErrorKind, Outcome, ProcessingFailure, SagaInstance, SagaState};
use herald_storage::{SagaRepository, StorageResult};

use crate::definition::{Evaluation, StateMachineDefinition};

const DEFAULT_SAVE_ATTEMPTS: u32 = 3;

/// Receives timeout registrations produced by ScheduleTimeout effects,
/// so a scheduler can deliver the timeout event without waiting for the
/// poller. Registration is best-effort; the timeout poller remains the
/// backstop.
#[async_trait]
pub trait SagaTimeoutSink: Send + Sync {
    async fn timeout_armed(
        &self,
        saga_type: &str,
        correlation_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;
}

pub struct SagaOrchestrator<S: SagaState> {
    definition: StateMachineDefinition<S>,
    repository: Arc<dyn SagaRepository<S>>,
    timeout_sink: Option<Arc<dyn SagaTimeoutSink>>,
    clock: Arc<dyn Clock>,
    max_save_attempts: u32,
}

impl<S: SagaState> SagaOrchestrator<S> {
    pub fn new(
        definition: StateMachineDefinition<S>,
        repository: Arc<dyn SagaRepository<S>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            definition,
            repository,
            timeout_sink: None,
            clock,
            max_save_attempts: DEFAULT_SAVE_ATTEMPTS,
        }
    }

    pub fn with_timeout_sink(mut self, sink: Arc<dyn SagaTimeoutSink>) -> Self {
        self.timeout_sink = Some(sink);
        self
    }

    pub fn with_max_save_attempts(mut self, attempts: u32) -> Self {
        self.max_save_attempts = attempts.max(1);
        self
    }

    pub fn repository(&self) -> &Arc<dyn SagaRepository<S>> {
        &self.repository
    }

    /// Handle one event addressed to this saga type.
    pub async fn handle_event(&self, envelope: &Envelope) -> Outcome {
        let Some(correlation_id) = envelope.correlation_id.clone() else {
            return Outcome::Failure(ProcessingFailure::new(
                ErrorKind::Validation,
                "saga event carries no correlation id",
            ));
        };

        for attempt in 0..self.max_save_attempts {
            let loaded = match self.repository.load(&correlation_id).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    return Outcome::Failure(
                        ProcessingFailure::new(e.kind(), "failed to load saga")
                            .with_cause(e.to_string()),
                    )
                }
            };

            let (mut instance, expected_version) = match loaded {
                Some(instance) => {
                    let version = instance.version;
                    (instance, version)
                }
                None if self.definition.is_initial_trigger(&envelope.message_type) => {
                    (SagaInstance::<S>::new(correlation_id.clone(), self.clock.now()), 0)
                }
                None => {
                    debug!(
                        correlation_id = %correlation_id,
                        message_type = %envelope.message_type,
                        "Event for unknown saga ignored"
                    );
                    return Outcome::skipped("no saga instance for correlation id");
                }
            };

            if instance.is_completed {
                return Outcome::skipped("saga already completed");
            }

            let Some(evaluation) = self.definition.evaluate(&mut instance, envelope) else {
                return Outcome::skipped(format!(
                    "no transition for event '{}' in state '{}'",
                    envelope.message_type, instance.current_state
                ));
            };

            let timeout_at = self.apply(&mut instance, &evaluation);

            match self.repository.save(&instance, expected_version).await {
                Ok(true) => {
                    metrics::counter!("herald.saga.transitions_total").increment(1);
                    if let (Some(at), Some(sink)) = (timeout_at, &self.timeout_sink) {
                        if let Err(e) =
                            sink.timeout_armed(S::saga_type(), &correlation_id, at).await
                        {
                            warn!(
                                correlation_id = %correlation_id,
                                error = %e,
                                "Failed to register saga timeout with scheduler"
                            );
                        }
                    }
                    if instance.is_completed {
                        info!(
                            saga_type = S::saga_type(),
                            correlation_id = %correlation_id,
                            "Saga completed"
                        );
                    }
                    return Outcome::success();
                }
                Ok(false) => {
                    // Another worker advanced the version; reload and
                    // re-evaluate from its state.
                    debug!(
                        correlation_id = %correlation_id,
                        attempt,
                        "Saga save lost version race, retrying"
                    );
                    metrics::counter!("herald.saga.version_conflicts_total").increment(1);
                    continue;
                }
                Err(e) => {
                    return Outcome::Failure(
                        ProcessingFailure::new(e.kind(), "failed to save saga")
                            .with_cause(e.to_string()),
                    )
                }
            }
        }

        Outcome::Failure(ProcessingFailure::new(
            ErrorKind::Concurrency,
            format!(
                "saga '{}' save contention exceeded {} attempts",
                correlation_id, self.max_save_attempts
            ),
        ))
    }

    /// Fold an evaluation into the instance; returns the armed timeout,
    /// if any.
    fn apply(&self, instance: &mut SagaInstance<S>, evaluation: &Evaluation) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        if let Some(next_state) = &evaluation.next_state {
            debug!(
                saga_type = S::saga_type(),
                correlation_id = %instance.correlation_id,
                from = %instance.current_state,
                to = %next_state,
                reason = evaluation.compensation_reason.as_deref().unwrap_or(""),
                "Saga transition"
            );
            instance.current_state = next_state.clone();
        }
        if evaluation.completed {
            instance.is_completed = true;
            instance.timeout_at = None;
        }
        instance.updated_at = now;

        match evaluation.timeout_after {
            Some(after) if !instance.is_completed => {
                let at = now
                    + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::hours(1));
                instance.timeout_at = Some(at);
                Some(at)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::{system_clock, MessageId, MessageKind};
    use herald_storage::InMemorySagaRepository;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct OrderSaga {
        paid: bool,
    }

    impl SagaState for OrderSaga {
        fn saga_type() -> &'static str {
            "order"
        }
    }

    fn definition() -> StateMachineDefinition<OrderSaga> {
        StateMachineDefinition::new("OrderCreated", "PaymentPending")
            .when("PaymentPending", "PaymentReceived", |binding| {
                binding.mutate(|data: &mut OrderSaga, _| data.paid = true).transition_to("Shipping")
            })
            .when("Shipping", "Shipped", |binding| binding.complete())
            .when("PaymentPending", "StartTimer", |binding| {
                binding.schedule_timeout(Duration::from_secs(60))
            })
    }

    fn orchestrator() -> SagaOrchestrator<OrderSaga> {
        SagaOrchestrator::new(
            definition(),
            Arc::new(InMemorySagaRepository::<OrderSaga>::new()),
            system_clock(),
        )
    }

    fn event(message_type: &str, correlation: &str) -> Envelope {
        Envelope::from_parts(
            MessageId::new(),
            MessageKind::Event,
            message_type,
            serde_json::json!({}),
        )
        .with_correlation_id(correlation)
    }

    #[tokio::test]
    async fn initial_event_creates_instance_at_version_one() {
        let orchestrator = orchestrator();
        let outcome = orchestrator.handle_event(&event("OrderCreated", "o-1")).await;
        assert!(outcome.is_success());

        let saga = orchestrator.repository().load("o-1").await.unwrap().unwrap();
        assert_eq!(saga.current_state, "PaymentPending");
        assert_eq!(saga.version, 1);
    }

    #[tokio::test]
    async fn full_lifecycle_to_completion() {
        let orchestrator = orchestrator();
        orchestrator.handle_event(&event("OrderCreated", "o-2")).await;
        orchestrator.handle_event(&event("PaymentReceived", "o-2")).await;
        let outcome = orchestrator.handle_event(&event("Shipped", "o-2")).await;
        assert!(outcome.is_success());

        let saga = orchestrator.repository().load("o-2").await.unwrap().unwrap();
        assert!(saga.is_completed);
        assert!(saga.data.paid);
        assert_eq!(saga.version, 3);
    }

    #[tokio::test]
    async fn non_initial_event_for_unknown_saga_is_skipped() {
        let orchestrator = orchestrator();
        let outcome = orchestrator.handle_event(&event("PaymentReceived", "missing")).await;
        assert!(matches!(outcome, Outcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn event_without_correlation_is_rejected() {
        let orchestrator = orchestrator();
        let envelope = Envelope::from_parts(
            MessageId::new(),
            MessageKind::Event,
            "OrderCreated",
            serde_json::json!({}),
        );
        let outcome = orchestrator.handle_event(&envelope).await;
        assert_eq!(outcome.failure_kind(), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn schedule_timeout_arms_timeout_at() {
        let orchestrator = orchestrator();
        orchestrator.handle_event(&event("OrderCreated", "o-3")).await;
        orchestrator.handle_event(&event("StartTimer", "o-3")).await;

        let saga = orchestrator.repository().load("o-3").await.unwrap().unwrap();
        assert!(saga.timeout_at.is_some());
        assert_eq!(saga.current_state, "PaymentPending");
    }

    #[tokio::test]
    async fn concurrent_initial_events_create_exactly_one_instance() {
        let repository = Arc::new(InMemorySagaRepository::<OrderSaga>::new());
        let orchestrator = Arc::new(SagaOrchestrator::new(
            definition(),
            Arc::clone(&repository) as Arc<dyn SagaRepository<OrderSaga>>,
            system_clock(),
        ));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let orchestrator = Arc::clone(&orchestrator);
            tasks.push(tokio::spawn(async move {
                orchestrator.handle_event(&event("OrderCreated", "race")).await
            }));
        }
        let outcomes: Vec<Outcome> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|outcome| outcome.unwrap())
            .collect();

        // The winner commits version 1; the loser reloads and finds no
        // transition for OrderCreated in PaymentPending.
        let successes = outcomes.iter().filter(|outcome| outcome.is_success()).count();
        let skips =
            outcomes.iter().filter(|outcome| matches!(outcome, Outcome::Skipped { .. })).count();
        assert_eq!((successes, skips), (1, 1));

        let saga = repository.load("race").await.unwrap().unwrap();
        assert_eq!(saga.current_state, "PaymentPending");
        assert_eq!(saga.version, 1);
    }
}
