//! Retry decorator
//!
//! Re-invokes the inner processor on transient failures with exponential
//! backoff: delay_n = min(base_delay * 2^n, max_delay), optionally
//! jittered. Success and permanent failures short-circuit; the backoff
//! wait observes cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use herald_common::config::RetryConfig;
use herald_common::{Envelope, Outcome};

use crate::processor::{ProcessContext, Processor};

pub struct RetryDecorator {
    config: RetryConfig,
    inner: Arc<dyn Processor>,
}

impl RetryDecorator {
    pub fn new(config: RetryConfig, inner: Arc<dyn Processor>) -> Self {
        Self { config, inner }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(32));
        let capped = exp.min(self.config.max_delay.as_millis()) as u64;
        let millis = if self.config.jitter && capped > 0 {
            let spread = (capped / 4).max(1);
            let offset = rand::thread_rng().gen_range(0..=2 * spread) as i64 - spread as i64;
            capped.saturating_add_signed(offset)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

#[async_trait]
impl Processor for RetryDecorator {
    async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        let mut attempt = 0;
        loop {
            if let Some(failure) = ctx.interruption() {
                return Outcome::Failure(failure);
            }

            let outcome = self.inner.process(envelope, ctx).await;

            let transient = match &outcome {
                Outcome::Failure(failure) => failure.is_transient(),
                _ => return outcome,
            };
            if !transient || attempt >= self.config.max_retries {
                return outcome;
            }

            let delay = self.delay_for(attempt);
            attempt += 1;
            debug!(
                message_id = %envelope.id,
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure"
            );

            tokio::select! {
                _ = ctx.cancellation().cancelled() => {
                    return Outcome::Failure(herald_common::ProcessingFailure::cancelled());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
