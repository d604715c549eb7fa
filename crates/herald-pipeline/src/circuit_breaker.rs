//! Circuit breaker decorator
//!
//! Counts transient failures within a sampling window; at the threshold
//! the circuit opens and calls fail fast with Failure(CircuitOpen) for
//! the break duration. After the break one half-open probe is admitted:
//! its success closes the circuit, its failure re-opens it. Transitions
//! are serialised under one mutex per circuit instance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use herald_common::config::CircuitBreakerConfig;
use herald_common::{Envelope, ErrorKind, Outcome, ProcessingFailure};

use crate::processor::{ProcessContext, Processor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed,
    Probe,
    Rejected,
}

struct CircuitInner {
    state: CircuitState,
    failures: u32,
    window_start: Instant,
    opened_at: Instant,
    probe_in_flight: bool,
}

/// The breaker itself, shareable across pipelines guarding the same
/// resource.
pub struct CircuitBreaker {
    inner: Mutex<CircuitInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failures: 0,
                window_start: now,
                opened_at: now,
                probe_in_flight: false,
            }),
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
            CircuitState::Open => {
                if inner.opened_at.elapsed() >= self.config.break_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!("Circuit half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    fn record(&self, admission: Admission, success: bool) {
        let mut inner = self.inner.lock();
        match admission {
            Admission::Probe => {
                inner.probe_in_flight = false;
                if success {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.window_start = Instant::now();
                    debug!("Circuit closed after successful probe");
                } else {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Instant::now();
                    warn!("Circuit re-opened after failed probe");
                }
            }
            Admission::Allowed => {
                if success {
                    inner.failures = 0;
                    return;
                }
                if inner.window_start.elapsed() >= self.config.sampling_duration {
                    inner.window_start = Instant::now();
                    inner.failures = 0;
                }
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Instant::now();
                    warn!(failures = inner.failures, "Circuit opened");
                }
            }
            Admission::Rejected => {}
        }
    }

    /// Break duration remaining, for fail-fast error messages.
    fn retry_after(&self) -> Duration {
        let inner = self.inner.lock();
        self.config.break_duration.saturating_sub(inner.opened_at.elapsed())
    }
}

pub struct CircuitBreakerDecorator {
    breaker: Arc<CircuitBreaker>,
    inner: Arc<dyn Processor>,
}

impl CircuitBreakerDecorator {
    pub fn new(config: CircuitBreakerConfig, inner: Arc<dyn Processor>) -> Self {
        Self { breaker: Arc::new(CircuitBreaker::new(config)), inner }
    }

    pub fn with_breaker(breaker: Arc<CircuitBreaker>, inner: Arc<dyn Processor>) -> Self {
        Self { breaker, inner }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl Processor for CircuitBreakerDecorator {
    async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        if let Some(failure) = ctx.interruption() {
            return Outcome::Failure(failure);
        }

        let admission = self.breaker.admit();
        if admission == Admission::Rejected {
            debug!(message_id = %envelope.id, "Circuit open, failing fast");
            return Outcome::Failure(
                ProcessingFailure::new(
                    ErrorKind::CircuitOpen,
                    format!(
                        "circuit open, retry after {}ms",
                        self.breaker.retry_after().as_millis()
                    ),
                ),
            );
        }

        let outcome = self.inner.process(envelope, ctx).await;

        // Only transient failures count toward the threshold; permanent
        // failures say nothing about downstream health.
        match &outcome {
            Outcome::Success(_) => self.breaker.record(admission, true),
            Outcome::Failure(failure) if failure.is_transient() => {
                self.breaker.record(admission, false)
            }
            Outcome::Failure(_) | Outcome::Skipped { .. } => {
                if admission == Admission::Probe {
                    // A neutral probe result ends the probe without moving
                    // the state; the next call probes again.
                    self.breaker.record(admission, true);
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::FnProcessor;
    use herald_common::{MessageId, MessageKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, break_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            break_duration: Duration::from_millis(break_ms),
            sampling_duration: Duration::from_secs(60),
        }
    }

    fn envelope() -> Envelope {
        Envelope::from_parts(MessageId::new(), MessageKind::Command, "c", serde_json::json!({}))
    }

    fn failing_inner(calls: Arc<AtomicU32>) -> Arc<dyn Processor> {
        Arc::new(FnProcessor::new(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Outcome::failure(ErrorKind::Transient, "down")
            }
        }))
    }

    #[tokio::test]
    async fn opens_at_threshold_without_invoking_inner() {
        let calls = Arc::new(AtomicU32::new(0));
        let decorator = CircuitBreakerDecorator::new(config(2, 100), failing_inner(Arc::clone(&calls)));
        let ctx = ProcessContext::new();

        let first = decorator.process(&envelope(), &ctx).await;
        let second = decorator.process(&envelope(), &ctx).await;
        let third = decorator.process(&envelope(), &ctx).await;

        assert_eq!(first.failure_kind(), Some(ErrorKind::Transient));
        assert_eq!(second.failure_kind(), Some(ErrorKind::Transient));
        assert_eq!(third.failure_kind(), Some(ErrorKind::CircuitOpen));
        // The rejected call never reached the inner processor.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(decorator.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn successful_probe_closes_after_break() {
        let calls = Arc::new(AtomicU32::new(0));
        let decorator = CircuitBreakerDecorator::new(config(2, 50), failing_inner(Arc::clone(&calls)));
        let ctx = ProcessContext::new();

        decorator.process(&envelope(), &ctx).await;
        decorator.process(&envelope(), &ctx).await;
        assert_eq!(decorator.breaker().state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Swap in a succeeding path by building a fresh decorator over
        // the same breaker.
        let succeeding = CircuitBreakerDecorator::with_breaker(
            Arc::clone(decorator.breaker()),
            Arc::new(FnProcessor::new(|_| async { Outcome::success() })),
        );
        let outcome = succeeding.process(&envelope(), &ctx).await;
        assert!(outcome.is_success());
        assert_eq!(succeeding.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let calls = Arc::new(AtomicU32::new(0));
        let decorator = CircuitBreakerDecorator::new(config(1, 20), failing_inner(Arc::clone(&calls)));
        let ctx = ProcessContext::new();

        decorator.process(&envelope(), &ctx).await;
        assert_eq!(decorator.breaker().state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(25)).await;
        let outcome = decorator.process(&envelope(), &ctx).await;
        assert_eq!(outcome.failure_kind(), Some(ErrorKind::Transient));
        assert_eq!(decorator.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn permanent_failures_do_not_trip() {
        let inner = Arc::new(FnProcessor::new(|_| async {
            Outcome::failure(ErrorKind::Permanent, "rejected")
        }));
        let decorator = CircuitBreakerDecorator::new(config(1, 100), inner);
        let ctx = ProcessContext::new();

        decorator.process(&envelope(), &ctx).await;
        decorator.process(&envelope(), &ctx).await;
        assert_eq!(decorator.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let flip = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&flip);
        let inner = Arc::new(FnProcessor::new(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                // Alternate failure and success.
                if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    Outcome::failure(ErrorKind::Transient, "blip")
                } else {
                    Outcome::success()
                }
            }
        }));
        let decorator = CircuitBreakerDecorator::new(config(2, 100), inner);
        let ctx = ProcessContext::new();

        for _ in 0..6 {
            decorator.process(&envelope(), &ctx).await;
        }
        // Alternating results never accumulate two failures in a row.
        assert_eq!(decorator.breaker().state(), CircuitState::Closed);
    }
}
