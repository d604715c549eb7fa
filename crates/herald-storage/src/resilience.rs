//! Resilience primitives shared by storage adapters
//!
//! A retry policy with exponential backoff and jitter, a circuit breaker
//! guarding a failing backend, and a combined connection policy that
//! applies both. Non-transient errors propagate immediately.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

// ============================================================================
// Retry policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_retry_delay: Duration,
    /// Add up to ±25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// delay_n = min(base * 2^n, max), with optional jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis().saturating_mul(1u128 << attempt.min(32));
        let capped = exp.min(self.max_retry_delay.as_millis()) as u64;
        let millis = if self.jitter && capped > 0 {
            let spread = (capped / 4).max(1);
            let offset = rand::thread_rng().gen_range(0..=2 * spread) as i64 - spread as i64;
            capped.saturating_add_signed(offset)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }

    /// Run `operation`, retrying transient failures with backoff.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    debug!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker guarding a storage backend. Failures within the sampling
/// window count toward the threshold; once Open, calls fail fast until
/// the break duration elapses, then a single half-open probe decides.
pub struct ResilienceCircuit {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    window_start: RwLock<Instant>,
    opened_at: RwLock<Option<Instant>>,

    failure_threshold: u32,
    break_duration: Duration,
    sampling_duration: Duration,
}

impl ResilienceCircuit {
    pub fn new(failure_threshold: u32, break_duration: Duration, sampling_duration: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            window_start: RwLock::new(Instant::now()),
            opened_at: RwLock::new(None),
            failure_threshold,
            break_duration,
            sampling_duration,
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Whether a call may proceed. Transitions Open -> HalfOpen when the
    /// break duration has elapsed.
    pub fn allow_request(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.read().map(|at| at.elapsed());
                if elapsed.map_or(false, |e| e >= self.break_duration) {
                    *self.state.write() = CircuitState::HalfOpen;
                    debug!("Storage circuit transitioning to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Closed;
                self.failure_count.store(0, Ordering::SeqCst);
                debug!("Storage circuit closed after successful probe");
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                // Restart the sampling window when it has elapsed.
                {
                    let mut window_start = self.window_start.write();
                    if window_start.elapsed() >= self.sampling_duration {
                        *window_start = Instant::now();
                        self.failure_count.store(0, Ordering::SeqCst);
                    }
                }
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.opened_at.write() = Some(Instant::now());
                    warn!(failures = count, "Storage circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Open;
                *self.opened_at.write() = Some(Instant::now());
                warn!("Storage circuit re-opened on failed probe");
            }
            CircuitState::Open => {}
        }
    }
}

// ============================================================================
// Connection policy
// ============================================================================

/// Retry + circuit breaker applied together, the policy resilient
/// storage wrappers delegate through.
pub struct ConnectionResilience {
    retry: RetryPolicy,
    circuit: Arc<ResilienceCircuit>,
}

impl ConnectionResilience {
    pub fn new(retry: RetryPolicy, circuit: Arc<ResilienceCircuit>) -> Self {
        Self { retry, circuit }
    }

    pub fn circuit(&self) -> &Arc<ResilienceCircuit> {
        &self.circuit
    }

    /// Run `operation` under the circuit breaker and retry policy.
    /// Returns `Unavailable` without invoking the operation while the
    /// circuit is open.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        if !self.circuit.allow_request() {
            return Err(StorageError::Unavailable("circuit open".to_string()));
        }
        let result = self.retry.execute(|| operation()).await;
        match &result {
            Ok(_) => self.circuit.record_success(),
            Err(error) if error.is_transient() => self.circuit.record_failure(),
            // Permanent errors are the caller's problem, not backend health.
            Err(_) => {}
        }
        result
    }
}

impl Default for ConnectionResilience {
    fn default() -> Self {
        Self::new(
            RetryPolicy::default(),
            Arc::new(ResilienceCircuit::new(5, Duration::from_secs(30), Duration::from_secs(60))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
            jitter: false,
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let result = policy
            .execute(move || {
                let attempt = seen.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(StorageError::Unavailable("down".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_propagate_immediately() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let result: StorageResult<()> = policy
            .execute(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Err(StorageError::Invalid("bad".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn circuit_opens_at_threshold_and_probes_after_break() {
        let circuit =
            ResilienceCircuit::new(2, Duration::from_millis(20), Duration::from_secs(60));
        assert!(circuit.allow_request());

        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Closed);
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.allow_request());

        std::thread::sleep(Duration::from_millis(25));
        assert!(circuit.allow_request());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        circuit.record_success();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_invoking() {
        let circuit =
            Arc::new(ResilienceCircuit::new(1, Duration::from_secs(60), Duration::from_secs(60)));
        let policy = ConnectionResilience::new(
            RetryPolicy { max_retries: 0, jitter: false, ..Default::default() },
            Arc::clone(&circuit),
        );

        let _ = policy
            .execute(|| async { Err::<(), _>(StorageError::Timeout("slow".into())) })
            .await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let result = policy
            .execute(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Ok(1) }
            })
            .await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
