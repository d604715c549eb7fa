//! End-to-end tests through the producer-facing bus surface.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use herald_storage::SagaRepository;

use herald::{
    EnqueueOptions, Envelope, ErrorKind, FnHandler, HeraldBuilder, HeraldConfig, InboxOptions,
    MessageId, MessageKind, MessagePayload, Outcome, OutboxPublishOptions, SagaState,
    StateMachineDefinition,
};

#[derive(Debug, Serialize, Deserialize)]
struct PlaceOrder {
    order_id: String,
}

impl MessagePayload for PlaceOrder {
    fn message_type() -> &'static str {
        "orders.place"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderTotal {
    order_id: String,
}

impl MessagePayload for OrderTotal {
    fn message_type() -> &'static str {
        "orders.total"
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
}

impl MessagePayload for OrderPlaced {
    fn message_type() -> &'static str {
        "orders.placed"
    }
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn command_query_and_event_round_trip() {
    let handled = Arc::new(AtomicU32::new(0));
    let events = Arc::new(AtomicU32::new(0));

    let command_counter = Arc::clone(&handled);
    let event_counter_a = Arc::clone(&events);
    let event_counter_b = Arc::clone(&events);

    let bus = HeraldBuilder::new()
        .register_command(
            "orders.place",
            FnHandler::new(move |_| {
                let counter = Arc::clone(&command_counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::success()
                }
            }),
        )
        .register_query(
            "orders.total",
            FnHandler::new(|envelope: Envelope| async move {
                let order_id = envelope.payload["order_id"].as_str().unwrap_or("").to_string();
                Outcome::success_with(serde_json::json!({ "order_id": order_id, "total": 42 }))
            }),
        )
        .subscribe(
            "orders.placed",
            FnHandler::new(move |_| {
                let counter = Arc::clone(&event_counter_a);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::success()
                }
            }),
        )
        .subscribe(
            "orders.placed",
            FnHandler::new(move |_| {
                let counter = Arc::clone(&event_counter_b);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::success()
                }
            }),
        )
        .build()
        .unwrap();

    let outcome = bus.send(&PlaceOrder { order_id: "o-1".into() }).await;
    assert!(outcome.is_success());
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    let outcome = bus.send_query(&OrderTotal { order_id: "o-1".into() }).await;
    assert_eq!(outcome.result().unwrap()["total"], serde_json::json!(42));

    let outcome = bus.publish(&OrderPlaced { order_id: "o-1".into() }).await;
    assert!(outcome.is_success());
    assert_eq!(events.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unregistered_command_reports_no_handler() {
    let bus = HeraldBuilder::new().build().unwrap();
    let outcome = bus.send(&PlaceOrder { order_id: "o-2".into() }).await;
    assert_eq!(outcome.failure_kind(), Some(ErrorKind::NoHandler));
}

#[tokio::test]
async fn invalid_configuration_enumerates_reasons() {
    let mut config = HeraldConfig::default();
    config.batching.max_batch_size = 0;
    config.circuit_breaker.failure_threshold = 0;

    let error = HeraldBuilder::with_config(config).build().unwrap_err();
    let text = error.to_string();
    assert!(text.contains("max_batch_size"));
    assert!(text.contains("failure_threshold"));
}

#[tokio::test]
async fn process_incoming_deduplicates_by_message_id() {
    let handled = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&handled);

    let bus = HeraldBuilder::new()
        .register_command(
            "orders.place",
            FnHandler::new(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::success()
                }
            }),
        )
        .build()
        .unwrap();

    let envelope = Envelope::from_parts(
        MessageId::new(),
        MessageKind::Command,
        "orders.place",
        serde_json::json!({ "order_id": "A" }),
    );

    let first = bus.process_incoming(&envelope, InboxOptions::default()).await.unwrap();
    let second = bus.process_incoming(&envelope, InboxOptions::default()).await.unwrap();

    assert!(!first.is_duplicate());
    assert!(second.is_duplicate());
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn outbox_stages_and_background_worker_drains() {
    let delivered = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&delivered);

    let mut config = HeraldConfig::default();
    config.outbox.polling_interval = Duration::from_millis(10);
    config.outbox.empty_backoff_ceiling = Duration::from_millis(40);

    let mut bus = HeraldBuilder::with_config(config)
        .subscribe(
            "orders.placed",
            FnHandler::new(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::success()
                }
            }),
        )
        .build()
        .unwrap();
    bus.start();

    let envelope = Envelope::event(&OrderPlaced { order_id: "o-3".into() }).unwrap();
    bus.publish_to_outbox(&envelope, OutboxPublishOptions::default()).await.unwrap();

    let drained =
        wait_until(Duration::from_secs(5), || delivered.load(Ordering::SeqCst) == 1).await;
    assert!(drained, "outbox entry was not delivered");
    assert_eq!(bus.outbox_metrics().entries_processed, 1);

    bus.shutdown().await;
}

#[tokio::test]
async fn queue_worker_drains_to_handler() {
    let handled = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&handled);

    let mut bus = HeraldBuilder::new()
        .register_command(
            "orders.place",
            FnHandler::new(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::success()
                }
            }),
        )
        .build()
        .unwrap();
    bus.start_queue("orders").unwrap();

    for n in 0..5 {
        let envelope = Envelope::from_parts(
            MessageId::new(),
            MessageKind::Command,
            "orders.place",
            serde_json::json!({ "order_id": n }),
        );
        bus.enqueue("orders", envelope, EnqueueOptions::default()).await.unwrap();
    }

    let drained = wait_until(Duration::from_secs(5), || handled.load(Ordering::SeqCst) == 5).await;
    assert!(drained, "queue did not drain");
    assert_eq!(bus.queue_depth("orders"), 0);

    bus.shutdown().await;
}

#[tokio::test]
async fn scheduled_message_dispatches_after_delay() {
    let handled = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&handled);

    let mut bus = HeraldBuilder::new()
        .subscribe(
            "orders.placed",
            FnHandler::new(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::success()
                }
            }),
        )
        .build()
        .unwrap();
    bus.start();

    let envelope = Envelope::event(&OrderPlaced { order_id: "o-4".into() }).unwrap();
    let started = std::time::Instant::now();
    bus.schedule(envelope, "dispatch", chrono::Utc::now() + chrono::Duration::milliseconds(50))
        .await
        .unwrap();

    let fired = wait_until(Duration::from_secs(2), || handled.load(Ordering::SeqCst) == 1).await;
    assert!(fired, "scheduled message never fired");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(45), "fired early: {:?}", elapsed);

    bus.shutdown().await;
}

#[tokio::test]
async fn cancelled_schedule_never_fires() {
    let handled = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&handled);

    let mut bus = HeraldBuilder::new()
        .subscribe(
            "orders.placed",
            FnHandler::new(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::success()
                }
            }),
        )
        .build()
        .unwrap();
    bus.start();

    let envelope = Envelope::event(&OrderPlaced { order_id: "o-5".into() }).unwrap();
    let id = bus
        .schedule(envelope, "dispatch", chrono::Utc::now() + chrono::Duration::milliseconds(80))
        .await
        .unwrap();
    assert!(bus.cancel_scheduled(id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    bus.shutdown().await;
}

// ---------------------------------------------------------------------
// Saga wiring through the bus
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OrderSaga {
    paid: bool,
}

impl SagaState for OrderSaga {
    fn saga_type() -> &'static str {
        "order"
    }
}

#[tokio::test]
async fn saga_progresses_through_bus_events() {
    let definition = StateMachineDefinition::<OrderSaga>::new("OrderCreated", "PaymentPending")
        .when("PaymentPending", "PaymentReceived", |binding| {
            binding.mutate(|data, _| data.paid = true).complete()
        });

    let repository =
        Arc::new(herald_storage::InMemorySagaRepository::<OrderSaga>::new());
    let mut bus = HeraldBuilder::new()
        .register_saga(
            definition,
            Arc::clone(&repository) as Arc<dyn herald_storage::SagaRepository<OrderSaga>>,
            &["OrderCreated", "PaymentReceived"],
        )
        .build()
        .unwrap();
    bus.start();

    let created = Envelope::from_parts(
        MessageId::new(),
        MessageKind::Event,
        "OrderCreated",
        serde_json::json!({}),
    )
    .with_correlation_id("order-9");
    assert!(bus.send_envelope(&created).await.is_success());

    let paid = Envelope::from_parts(
        MessageId::new(),
        MessageKind::Event,
        "PaymentReceived",
        serde_json::json!({}),
    )
    .with_correlation_id("order-9");
    assert!(bus.send_envelope(&paid).await.is_success());

    let saga = repository.load("order-9").await.unwrap().unwrap();
    assert!(saga.is_completed);
    assert!(saga.data.paid);
    assert_eq!(saga.version, 2);

    bus.shutdown().await;
}
