//! State machine definition
//!
//! Declares, per saga type: the initial trigger event and the state it
//! transitions to, and per-(state, event) bindings with optional guards,
//! data mutations, and effects. Evaluation is pure; the orchestrator
//! applies the result under optimistic concurrency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use herald_common::{Envelope, SagaInstance, SagaState, SAGA_INITIAL_STATE};

/// State entered by a Compensate effect.
pub const COMPENSATING_STATE: &str = "Compensating";

/// Effects a binding may produce.
#[derive(Clone)]
pub enum SagaEffect {
    TransitionTo(String),
    Complete,
    /// An ordinary transition into the compensation path.
    Compensate(String),
    /// Arm the saga's timeout relative to evaluation time.
    ScheduleTimeout(Duration),
}

type Guard<S> = Arc<dyn Fn(&SagaInstance<S>, &Envelope) -> bool + Send + Sync>;
type Mutator<S> = Arc<dyn Fn(&mut S, &Envelope) + Send + Sync>;

pub struct Binding<S> {
    guard: Option<Guard<S>>,
    mutator: Option<Mutator<S>>,
    effects: Vec<SagaEffect>,
}

/// Fluent configuration for one (state, event) binding.
pub struct BindingBuilder<S> {
    binding: Binding<S>,
}

impl<S: SagaState> BindingBuilder<S> {
    fn new() -> Self {
        Self { binding: Binding { guard: None, mutator: None, effects: Vec::new() } }
    }

    pub fn guard(
        mut self,
        guard: impl Fn(&SagaInstance<S>, &Envelope) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.binding.guard = Some(Arc::new(guard));
        self
    }

    pub fn mutate(mut self, mutator: impl Fn(&mut S, &Envelope) + Send + Sync + 'static) -> Self {
        self.binding.mutator = Some(Arc::new(mutator));
        self
    }

    pub fn transition_to(mut self, state: impl Into<String>) -> Self {
        self.binding.effects.push(SagaEffect::TransitionTo(state.into()));
        self
    }

    pub fn complete(mut self) -> Self {
        self.binding.effects.push(SagaEffect::Complete);
        self
    }

    pub fn compensate(mut self, reason: impl Into<String>) -> Self {
        self.binding.effects.push(SagaEffect::Compensate(reason.into()));
        self
    }

    pub fn schedule_timeout(mut self, after: Duration) -> Self {
        self.binding.effects.push(SagaEffect::ScheduleTimeout(after));
        self
    }
}

/// Result of evaluating one event against an instance.
pub struct Evaluation {
    pub next_state: Option<String>,
    pub completed: bool,
    pub compensation_reason: Option<String>,
    pub timeout_after: Option<Duration>,
}

pub struct StateMachineDefinition<S> {
    initial_trigger: String,
    bindings: HashMap<(String, String), Vec<Binding<S>>>,
}

impl<S: SagaState> StateMachineDefinition<S> {
    /// Declare the initial trigger: `trigger_event` creates the saga and
    /// transitions it from the Initial state to `target_state`.
    pub fn new(trigger_event: impl Into<String>, target_state: impl Into<String>) -> Self {
        let trigger_event = trigger_event.into();
        let target_state = target_state.into();
        let mut definition =
            Self { initial_trigger: trigger_event.clone(), bindings: HashMap::new() };
        definition = definition.when(SAGA_INITIAL_STATE, trigger_event, move |binding| {
            binding.transition_to(target_state.clone())
        });
        definition
    }

    /// Bind `event` in `state`. Bindings for the same pair are tried in
    /// declaration order; the first whose guard passes wins.
    pub fn when(
        mut self,
        state: impl Into<String>,
        event: impl Into<String>,
        configure: impl FnOnce(BindingBuilder<S>) -> BindingBuilder<S>,
    ) -> Self {
        let builder = configure(BindingBuilder::new());
        self.bindings
            .entry((state.into(), event.into()))
            .or_default()
            .push(builder.binding);
        self
    }

    pub fn is_initial_trigger(&self, event: &str) -> bool {
        self.initial_trigger == event
    }

    /// Evaluate `envelope` against `instance`, mutating the instance's
    /// data in place. Returns None when no binding matches (the event is
    /// ignored in this state).
    pub fn evaluate(&self, instance: &mut SagaInstance<S>, envelope: &Envelope) -> Option<Evaluation> {
        let key = (instance.current_state.clone(), envelope.message_type.clone());
        let bindings = self.bindings.get(&key)?;
        let binding = bindings
            .iter()
            .find(|binding| binding.guard.as_ref().map_or(true, |guard| guard(instance, envelope)))?;

        if let Some(mutator) = &binding.mutator {
            mutator(&mut instance.data, envelope);
        }

        let mut evaluation = Evaluation {
            next_state: None,
            completed: false,
            compensation_reason: None,
            timeout_after: None,
        };
        for effect in &binding.effects {
            match effect {
                SagaEffect::TransitionTo(state) => evaluation.next_state = Some(state.clone()),
                SagaEffect::Complete => evaluation.completed = true,
                SagaEffect::Compensate(reason) => {
                    evaluation.next_state = Some(COMPENSATING_STATE.to_string());
                    evaluation.compensation_reason = Some(reason.clone());
                }
                SagaEffect::ScheduleTimeout(after) => evaluation.timeout_after = Some(*after),
            }
        }
        Some(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herald_common::{MessageId, MessageKind};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct OrderSaga {
        amount: u64,
    }

    impl SagaState for OrderSaga {
        fn saga_type() -> &'static str {
            "order"
        }
    }

    fn event(message_type: &str, amount: u64) -> Envelope {
        Envelope::from_parts(
            MessageId::new(),
            MessageKind::Event,
            message_type,
            serde_json::json!({ "amount": amount }),
        )
    }

    fn definition() -> StateMachineDefinition<OrderSaga> {
        StateMachineDefinition::new("OrderCreated", "PaymentPending")
            .when("PaymentPending", "PaymentReceived", |binding| {
                binding
                    .guard(|_, envelope| envelope.payload["amount"].as_u64().unwrap_or(0) > 0)
                    .mutate(|data: &mut OrderSaga, envelope| {
                        data.amount = envelope.payload["amount"].as_u64().unwrap_or(0);
                    })
                    .transition_to("Shipping")
            })
            .when("PaymentPending", "PaymentFailed", |binding| {
                binding.compensate("payment failed")
            })
            .when("Shipping", "Shipped", |binding| binding.complete())
    }

    #[test]
    fn initial_trigger_transitions_out_of_initial() {
        let definition = definition();
        assert!(definition.is_initial_trigger("OrderCreated"));

        let mut instance = SagaInstance::<OrderSaga>::new("corr", Utc::now());
        let evaluation = definition.evaluate(&mut instance, &event("OrderCreated", 0)).unwrap();
        assert_eq!(evaluation.next_state.as_deref(), Some("PaymentPending"));
        assert!(!evaluation.completed);
    }

    #[test]
    fn guard_blocks_binding() {
        let definition = definition();
        let mut instance = SagaInstance::<OrderSaga>::new("corr", Utc::now());
        instance.current_state = "PaymentPending".to_string();

        // Zero amount fails the guard; no other binding matches.
        assert!(definition.evaluate(&mut instance, &event("PaymentReceived", 0)).is_none());

        let evaluation = definition.evaluate(&mut instance, &event("PaymentReceived", 25)).unwrap();
        assert_eq!(evaluation.next_state.as_deref(), Some("Shipping"));
        assert_eq!(instance.data.amount, 25);
    }

    #[test]
    fn compensate_routes_to_compensating_state() {
        let definition = definition();
        let mut instance = SagaInstance::<OrderSaga>::new("corr", Utc::now());
        instance.current_state = "PaymentPending".to_string();

        let evaluation = definition.evaluate(&mut instance, &event("PaymentFailed", 0)).unwrap();
        assert_eq!(evaluation.next_state.as_deref(), Some(COMPENSATING_STATE));
        assert_eq!(evaluation.compensation_reason.as_deref(), Some("payment failed"));
    }

    #[test]
    fn unbound_event_is_ignored() {
        let definition = definition();
        let mut instance = SagaInstance::<OrderSaga>::new("corr", Utc::now());
        assert!(definition.evaluate(&mut instance, &event("Unrelated", 0)).is_none());
    }
}
