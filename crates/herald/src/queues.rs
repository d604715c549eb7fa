//! Named queue management
//!
//! Lazily creates one in-memory transport per queue name (channel or
//! ring buffer per configuration) and runs one worker per started queue
//! that drains items through the processing pipeline: Success acks,
//! failures nack with a short redelivery delay.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use herald_common::config::QueueConfig;
use herald_common::{Clock, EnqueueOptions, Envelope, HeraldError, Outcome, QueueMode};
use herald_pipeline::{ProcessContext, Processor};
use herald_queue::{
    channel::ChannelQueueConfig, ring::RingQueueConfig, ChannelQueue, MessageQueue, QueueItem,
    RingQueue,
};

const NACK_DELAY: Duration = Duration::from_secs(5);

struct QueueRuntime {
    queue: Arc<dyn MessageQueue>,
    worker: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

pub struct QueueManager {
    config: QueueConfig,
    processor: Arc<dyn Processor>,
    clock: Arc<dyn Clock>,
    queues: DashMap<String, QueueRuntime>,
}

impl QueueManager {
    pub fn new(config: QueueConfig, processor: Arc<dyn Processor>, clock: Arc<dyn Clock>) -> Self {
        Self { config, processor, clock, queues: DashMap::new() }
    }

    fn build_queue(&self) -> Result<Arc<dyn MessageQueue>, HeraldError> {
        match self.config.mode {
            QueueMode::Channel => Ok(Arc::new(ChannelQueue::new(ChannelQueueConfig {
                capacity: self.config.capacity,
                drop_when_full: self.config.drop_when_full,
                lease_timeout: self.config.lease_timeout,
            }))),
            QueueMode::RingBuffer => {
                let queue = RingQueue::new(RingQueueConfig {
                    buffer_size: self.config.buffer_size,
                    wait_strategy: self.config.wait_strategy,
                    producer_mode: self.config.producer_mode,
                    lease_timeout: self.config.lease_timeout,
                })
                .map_err(|e| HeraldError::Configuration(e.to_string()))?;
                Ok(Arc::new(queue))
            }
        }
    }

    /// Add a message to a named queue, creating the queue on first use.
    /// Returns the enqueued message's id as the receipt.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        envelope: Envelope,
        options: EnqueueOptions,
    ) -> Result<herald_common::MessageId, HeraldError> {
        let queue = match self.queues.get(queue_name) {
            Some(runtime) => Arc::clone(&runtime.queue),
            None => {
                let queue = self.build_queue()?;
                let runtime = QueueRuntime {
                    queue: Arc::clone(&queue),
                    worker: None,
                    shutdown: CancellationToken::new(),
                };
                // First writer wins the insert race.
                self.queues.entry(queue_name.to_string()).or_insert(runtime);
                Arc::clone(&self.queues.get(queue_name).expect("just inserted").queue)
            }
        };

        let id = envelope.id;
        let mut item = QueueItem::new(envelope).with_priority(options.priority);
        if let Some(delay) = options.delay {
            item = item.with_delay(delay);
        }
        queue.enqueue(item).await.map_err(|e| HeraldError::Queue(e.to_string()))?;
        Ok(id)
    }

    /// Start the worker draining a named queue through the pipeline.
    pub fn start_queue(&self, queue_name: &str) -> Result<(), HeraldError> {
        let mut runtime = match self.queues.get_mut(queue_name) {
            Some(runtime) => runtime,
            None => {
                let queue = self.build_queue()?;
                self.queues.insert(
                    queue_name.to_string(),
                    QueueRuntime { queue, worker: None, shutdown: CancellationToken::new() },
                );
                self.queues.get_mut(queue_name).expect("just inserted")
            }
        };
        if runtime.worker.is_some() {
            return Ok(());
        }

        let queue = Arc::clone(&runtime.queue);
        let processor = Arc::clone(&self.processor);
        let clock = Arc::clone(&self.clock);
        let shutdown = runtime.shutdown.clone();
        let name = queue_name.to_string();

        info!(queue = %name, "Starting queue worker");
        runtime.worker = Some(tokio::spawn(async move {
            loop {
                let leased = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    leased = queue.dequeue() => leased,
                };
                let leased = match leased {
                    Ok(Some(leased)) => leased,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(queue = %name, error = %e, "Queue dequeue failed");
                        break;
                    }
                };

                let ctx = ProcessContext::for_envelope(&leased.item.envelope, Arc::clone(&clock))
                    .with_cancellation(shutdown.child_token());
                let outcome = processor.process(&leased.item.envelope, &ctx).await;
                match outcome {
                    Outcome::Success(_) | Outcome::Skipped { .. } => {
                        let _ = queue.ack(leased.lease_id).await;
                    }
                    Outcome::Failure(failure) => {
                        debug!(
                            queue = %name,
                            message_id = %leased.item.envelope.id,
                            kind = %failure.kind,
                            "Queue item failed, re-queueing"
                        );
                        let _ = queue.nack(leased.lease_id, Some(NACK_DELAY)).await;
                    }
                }
            }
            debug!(queue = %name, "Queue worker exited");
        }));
        Ok(())
    }

    /// Stop a queue's worker and close the queue.
    pub async fn stop_queue(&self, queue_name: &str) -> Result<(), HeraldError> {
        let Some(mut runtime) = self.queues.get_mut(queue_name) else {
            return Ok(());
        };
        runtime.shutdown.cancel();
        runtime.queue.close();
        if let Some(worker) = runtime.worker.take() {
            drop(runtime);
            let _ = worker.await;
        }
        Ok(())
    }

    pub fn depth(&self, queue_name: &str) -> usize {
        self.queues.get(queue_name).map(|runtime| runtime.queue.depth()).unwrap_or(0)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn stop_all(&self) {
        let names = self.queue_names();
        for name in names {
            let _ = self.stop_queue(&name).await;
        }
    }
}
