//! Idempotency store
//!
//! Keyed cache mapping an idempotency key to a cached outcome with an
//! expiry. Lookups read through expiry: a record past its `expires_at`
//! is treated as absent. Stores are pluggable; the in-memory
//! implementation here uses a concurrent map with a periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use herald_common::{Clock, IdempotencyOutcome, IdempotencyRecord};

use crate::error::{StorageError, StorageResult};

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch the record for `key`, treating expired records as absent.
    async fn get(&self, key: &str) -> StorageResult<Option<IdempotencyRecord>>;

    async fn store_success(
        &self,
        key: &str,
        result: serde_json::Value,
        ttl: Duration,
    ) -> StorageResult<()>;

    async fn store_failure(
        &self,
        key: &str,
        cause: serde_json::Value,
        ttl: Duration,
    ) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Remove expired records; returns how many were removed.
    async fn cleanup_expired(&self) -> StorageResult<u64>;
}

/// Concurrent-map store; expiry is enforced on read and by
/// [`spawn_sweeper`].
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { records: DashMap::new(), clock }
    }

    fn put(&self, key: &str, outcome: IdempotencyOutcome, result: serde_json::Value, ttl: Duration) -> StorageResult<()> {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl).map_err(|e| StorageError::Invalid(e.to_string()))?;
        self.records.insert(
            key.to_string(),
            IdempotencyRecord { key: key.to_string(), outcome, result, expires_at },
        );
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> StorageResult<Option<IdempotencyRecord>> {
        let now = self.clock.now();
        Ok(self
            .records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.clone()))
    }

    async fn store_success(
        &self,
        key: &str,
        result: serde_json::Value,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.put(key, IdempotencyOutcome::Success, result, ttl)
    }

    async fn store_failure(
        &self,
        key: &str,
        cause: serde_json::Value,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.put(key, IdempotencyOutcome::Failure, cause, ttl)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn cleanup_expired(&self) -> StorageResult<u64> {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        Ok((before - self.records.len()) as u64)
    }
}

/// Spawn a background sweep over an idempotency store. The task runs
/// until the token is cancelled.
pub fn spawn_sweeper(
    store: Arc<dyn IdempotencyStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match store.cleanup_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "Swept expired idempotency records"),
                        Err(e) => warn!(error = %e, "Idempotency sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::ManualClock;

    #[tokio::test]
    async fn success_record_expires_after_ttl() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryIdempotencyStore::new(clock.clone());

        store
            .store_success("k", serde_json::json!({"ok": true}), Duration::from_secs(60))
            .await
            .unwrap();

        let record = store.get("k").await.unwrap().unwrap();
        assert_eq!(record.outcome, IdempotencyOutcome::Success);
        assert!(store.exists("k").await.unwrap());

        clock.advance(Duration::from_secs(61));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_counts_removed_records() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryIdempotencyStore::new(clock.clone());
        store.store_success("a", serde_json::json!(1), Duration::from_secs(10)).await.unwrap();
        store.store_failure("b", serde_json::json!("err"), Duration::from_secs(10)).await.unwrap();
        store.store_success("c", serde_json::json!(3), Duration::from_secs(120)).await.unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.cleanup_expired().await.unwrap(), 2);
        assert!(store.exists("c").await.unwrap());
    }
}
