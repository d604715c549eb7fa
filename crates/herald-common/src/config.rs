//! Process-wide configuration surface
//!
//! One deserializable object enumerating every recognized option. All
//! sections have working defaults; `validate()` collects every violation
//! at once so startup can abort with the full list of reasons.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::HeraldError;

/// Transaction isolation requested by the Transaction decorator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Queue backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QueueMode {
    #[default]
    Channel,
    RingBuffer,
}

/// Ring consumer wait strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WaitStrategy {
    /// No yield; lowest latency, burns a core.
    BusySpin,
    /// Brief spin then cooperative yield.
    Yielding,
    /// Spin, yield, then short sleeps of rising length.
    #[default]
    Sleeping,
    /// Wait on a notification primitive.
    Blocking,
}

/// Ring producer coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProducerMode {
    Single,
    #[default]
    Multi,
}

/// Message version compatibility policy, consumed by serialization
/// adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompatibilityMode {
    Strict,
    #[default]
    Backward,
    Forward,
    Flexible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Cache lifetime for successful outcomes.
    pub success_ttl: Duration,
    /// Cache lifetime for failed outcomes.
    pub failure_ttl: Duration,
    /// Whether failed outcomes are cached at all.
    pub cache_failures: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            success_ttl: Duration::from_secs(3600),
            failure_ttl: Duration::from_secs(300),
            cache_failures: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub batch_timeout: Duration,
    pub max_degree_of_parallelism: usize,
    /// When false, the first failed message aborts the rest of the batch.
    pub continue_on_failure: bool,
    /// Re-run a failed batch message-by-message.
    pub fallback_to_single: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            min_batch_size: 1,
            batch_timeout: Duration::from_millis(250),
            max_degree_of_parallelism: 4,
            continue_on_failure: true,
            fallback_to_single: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add random jitter (up to ±25%) to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the sampling window before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays Open before admitting a probe.
    pub break_duration: Duration,
    /// Window over which failures are counted.
    pub sampling_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
            sampling_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub polling_interval: Duration,
    pub batch_size: u32,
    pub max_retries: u32,
    /// Processing claims older than this are reclaimable.
    pub lease_timeout: Duration,
    /// Ceiling for the empty-poll backoff.
    pub empty_backoff_ceiling: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(500),
            batch_size: 100,
            max_retries: 3,
            lease_timeout: Duration::from_secs(300),
            empty_backoff_ceiling: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Reject re-processing of already-seen message ids.
    pub require_idempotency: bool,
    /// Processed entries older than this may be purged.
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            require_idempotency: true,
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub mode: QueueMode,
    /// Slot count for RingBuffer mode; must be a power of two.
    pub buffer_size: usize,
    pub wait_strategy: WaitStrategy,
    pub producer_mode: ProducerMode,
    /// Bounded capacity for Channel mode; None for unbounded.
    pub capacity: Option<usize>,
    /// Evict the oldest item instead of suspending the producer.
    pub drop_when_full: bool,
    /// Unacknowledged entries become visible again after this long.
    pub lease_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Channel,
            buffer_size: 1024,
            wait_strategy: WaitStrategy::default(),
            producer_mode: ProducerMode::default(),
            capacity: None,
            drop_when_full: false,
            lease_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub polling_interval: Duration,
    /// Entries due within this window are claimed by a poll.
    pub look_ahead: Duration,
    /// Delivering claims older than this are reclaimable.
    pub claim_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            look_ahead: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub isolation_level: IsolationLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub conversion_timeout: Duration,
    pub max_conversion_steps: u32,
    pub default_compatibility_mode: CompatibilityMode,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            conversion_timeout: Duration::from_secs(5),
            max_conversion_steps: 8,
            default_compatibility_mode: CompatibilityMode::default(),
        }
    }
}

/// Lower bound for background worker cadence.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(10);

/// Process-wide configuration for a Herald runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    pub idempotency: IdempotencyConfig,
    pub batching: BatchingConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub outbox: OutboxConfig,
    pub inbox: InboxConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub transaction: TransactionConfig,
    pub conversion: ConversionConfig,
}

impl HeraldConfig {
    /// Validate the whole surface, collecting every violation.
    pub fn validate(&self) -> Result<(), HeraldError> {
        let mut reasons = Vec::new();

        if self.batching.max_batch_size == 0 {
            reasons.push("batching.max_batch_size must be greater than zero".to_string());
        }
        if self.batching.batch_timeout.is_zero() {
            reasons.push("batching.batch_timeout must be greater than zero".to_string());
        }
        if self.batching.min_batch_size > self.batching.max_batch_size {
            reasons.push(format!(
                "batching.min_batch_size ({}) exceeds max_batch_size ({})",
                self.batching.min_batch_size, self.batching.max_batch_size
            ));
        }
        if self.batching.max_degree_of_parallelism == 0 {
            reasons.push("batching.max_degree_of_parallelism must be greater than zero".to_string());
        }

        if self.retry.base_delay.is_zero() {
            reasons.push("retry.base_delay must be greater than zero".to_string());
        }
        if self.retry.max_delay < self.retry.base_delay {
            reasons.push("retry.max_delay must be at least retry.base_delay".to_string());
        }

        if self.circuit_breaker.failure_threshold == 0 {
            reasons.push("circuit_breaker.failure_threshold must be greater than zero".to_string());
        }
        if self.circuit_breaker.break_duration.is_zero() {
            reasons.push("circuit_breaker.break_duration must be greater than zero".to_string());
        }
        if self.circuit_breaker.sampling_duration.is_zero() {
            reasons.push("circuit_breaker.sampling_duration must be greater than zero".to_string());
        }

        if self.queue.mode == QueueMode::RingBuffer && !self.queue.buffer_size.is_power_of_two() {
            reasons.push(format!(
                "queue.buffer_size ({}) must be a power of two for the ring buffer",
                self.queue.buffer_size
            ));
        }
        if self.queue.buffer_size == 0 {
            reasons.push("queue.buffer_size must be greater than zero".to_string());
        }
        if let Some(capacity) = self.queue.capacity {
            if capacity == 0 {
                reasons.push("queue.capacity must be greater than zero when bounded".to_string());
            }
        }

        if self.outbox.polling_interval < MIN_POLLING_INTERVAL {
            reasons.push(format!(
                "outbox.polling_interval must be at least {:?}",
                MIN_POLLING_INTERVAL
            ));
        }
        if self.outbox.batch_size == 0 {
            reasons.push("outbox.batch_size must be greater than zero".to_string());
        }

        if self.scheduler.polling_interval < MIN_POLLING_INTERVAL {
            reasons.push(format!(
                "scheduler.polling_interval must be at least {:?}",
                MIN_POLLING_INTERVAL
            ));
        }

        if self.inbox.retention.is_zero() {
            reasons.push("inbox.retention must be greater than zero".to_string());
        }

        if self.idempotency.success_ttl.is_zero() {
            reasons.push("idempotency.success_ttl must be greater than zero".to_string());
        }
        if self.idempotency.cache_failures && self.idempotency.failure_ttl.is_zero() {
            reasons.push(
                "idempotency.failure_ttl must be greater than zero when cache_failures is set"
                    .to_string(),
            );
        }

        if self.conversion.max_conversion_steps == 0 {
            reasons.push("conversion.max_conversion_steps must be greater than zero".to_string());
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

    #[test]
    fn default_config_is_valid() {
        assert!(HeraldConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut config = HeraldConfig::default();
        config.batching.max_batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn zero_batch_timeout_rejected() {
        let mut config = HeraldConfig::default();
        config.batching.batch_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_power_of_two_ring_rejected() {
        let mut config = HeraldConfig::default();
        config.queue.mode = QueueMode::RingBuffer;
        config.queue.buffer_size = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn power_of_two_ring_accepted() {
        let mut config = HeraldConfig::default();
        config.queue.mode = QueueMode::RingBuffer;
        config.queue.buffer_size = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn all_violations_reported_together() {
        let mut config = HeraldConfig::default();
        config.batching.max_batch_size = 0;
        config.circuit_breaker.failure_threshold = 0;
        config.outbox.batch_size = 0;
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_batch_size"));
        assert!(message.contains("failure_threshold"));
        assert!(message.contains("outbox.batch_size"));
    }
}
