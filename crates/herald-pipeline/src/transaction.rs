//! Transaction decorator
//!
//! Opens a unit of work at the configured isolation level, invokes the
//! inner processor, commits on Success and rolls back otherwise. A
//! nested invocation joins the ambient transaction via a context-scope
//! marker instead of opening its own.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use herald_common::{Envelope, ErrorKind, IsolationLevel, Outcome, ProcessingFailure};
use herald_storage::StorageResult;

use crate::processor::{ProcessContext, Processor};

const AMBIENT_TX_KEY: &str = "herald.transaction.active";

/// One open transaction on the underlying storage provider.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn commit(self: Box<Self>) -> StorageResult<()>;
    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

#[async_trait]
pub trait UnitOfWorkFactory: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> StorageResult<Box<dyn UnitOfWork>>;
}

/// No-op unit of work for in-memory wiring and tests.
pub struct NoopUnitOfWork;

#[async_trait]
impl UnitOfWork for NoopUnitOfWork {
    async fn commit(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

pub struct NoopUnitOfWorkFactory;

#[async_trait]
impl UnitOfWorkFactory for NoopUnitOfWorkFactory {
    async fn begin(&self, _isolation: IsolationLevel) -> StorageResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(NoopUnitOfWork))
    }
}

pub struct TransactionDecorator {
    factory: Arc<dyn UnitOfWorkFactory>,
    isolation: IsolationLevel,
    inner: Arc<dyn Processor>,
}

impl TransactionDecorator {
    pub fn new(
        factory: Arc<dyn UnitOfWorkFactory>,
        isolation: IsolationLevel,
        inner: Arc<dyn Processor>,
    ) -> Self {
        Self { factory, isolation, inner }
    }
}

#[async_trait]
impl Processor for TransactionDecorator {
    async fn process(&self, envelope: &Envelope, ctx: &ProcessContext) -> Outcome {
        if let Some(failure) = ctx.interruption() {
            return Outcome::Failure(failure);
        }

        // Join the ambient transaction when one is already open.
        if ctx.scope_contains(AMBIENT_TX_KEY) {
            return self.inner.process(envelope, ctx).await;
        }

        let uow = match self.factory.begin(self.isolation).await {
            Ok(uow) => uow,
            Err(e) => {
                return Outcome::Failure(
                    ProcessingFailure::new(e.kind(), "failed to begin transaction")
                        .with_cause(e.to_string()),
                );
            }
        };

        ctx.scope_set(AMBIENT_TX_KEY, serde_json::Value::Bool(true));
        let outcome = self.inner.process(envelope, ctx).await;
        ctx.scope_remove(AMBIENT_TX_KEY);

        match &outcome {
            Outcome::Success(_) => {
                if let Err(e) = uow.commit().await {
                    warn!(message_id = %envelope.id, error = %e, "Transaction commit failed");
                    return Outcome::Failure(
                        ProcessingFailure::new(e.kind(), "transaction commit failed")
                            .with_cause(e.to_string()),
                    );
                }
            }
            Outcome::Failure(_) | Outcome::Skipped { .. } => {
                if let Err(e) = uow.rollback().await {
                    warn!(message_id = %envelope.id, error = %e, "Transaction rollback failed");
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

    #[derive(Default)]
    struct RecordingState {
        begun: AtomicU32,
        committed: AtomicU32,
        rolled_back: AtomicU32,
    }

    struct RecordingUow(Arc<RecordingState>);

    #[async_trait]
    impl UnitOfWork for RecordingUow {
        async fn commit(self: Box<Self>) -> StorageResult<()> {
            self.0.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> StorageResult<()> {
            self.0.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RecordingFactory(Arc<RecordingState>);

    #[async_trait]
    impl UnitOfWorkFactory for RecordingFactory {
        async fn begin(&self, _isolation: IsolationLevel) -> StorageResult<Box<dyn UnitOfWork>> {
            self.0.begun.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingUow(Arc::clone(&self.0))))
        }
    }

    fn envelope() -> Envelope {
        Envelope::from_parts(MessageId::new(), MessageKind::Command, "c", serde_json::json!({}))
    }

    #[tokio::test]
    async fn success_commits() {
        let state = Arc::new(RecordingState::default());
        let decorator = TransactionDecorator::new(
            Arc::new(RecordingFactory(Arc::clone(&state))),
            IsolationLevel::ReadCommitted,
            Arc::new(FnProcessor::new(|_| async { Outcome::success() })),
        );
        decorator.process(&envelope(), &ProcessContext::new()).await;
        assert_eq!(state.begun.load(Ordering::SeqCst), 1);
        assert_eq!(state.committed.load(Ordering::SeqCst), 1);
        assert_eq!(state.rolled_back.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_rolls_back() {
        let state = Arc::new(RecordingState::default());
        let decorator = TransactionDecorator::new(
            Arc::new(RecordingFactory(Arc::clone(&state))),
            IsolationLevel::ReadCommitted,
            Arc::new(FnProcessor::new(|_| async {
                Outcome::failure(ErrorKind::Permanent, "no")
            })),
        );
        decorator.process(&envelope(), &ProcessContext::new()).await;
        assert_eq!(state.committed.load(Ordering::SeqCst), 0);
        assert_eq!(state.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nested_invocation_joins_ambient_transaction() {
        let state = Arc::new(RecordingState::default());
        let factory = Arc::new(RecordingFactory(Arc::clone(&state)));

        let inner = Arc::new(TransactionDecorator::new(
            Arc::clone(&factory) as Arc<dyn UnitOfWorkFactory>,
            IsolationLevel::ReadCommitted,
            Arc::new(FnProcessor::new(|_| async { Outcome::success() })),
        ));
        let outer = TransactionDecorator::new(
            factory,
            IsolationLevel::ReadCommitted,
            inner,
        );

        outer.process(&envelope(), &ProcessContext::new()).await;
        // Only the outer frame opened a transaction.
        assert_eq!(state.begun.load(Ordering::SeqCst), 1);
        assert_eq!(state.committed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn marker_restored_after_exit() {
        let state = Arc::new(RecordingState::default());
        let decorator = TransactionDecorator::new(
            Arc::new(RecordingFactory(state)),
            IsolationLevel::ReadCommitted,
            Arc::new(FnProcessor::new(|_| async { Outcome::success() })),
        );
        let ctx = ProcessContext::new();
        decorator.process(&envelope(), &ctx).await;
        assert!(!ctx.scope_contains(AMBIENT_TX_KEY));
    }
}
