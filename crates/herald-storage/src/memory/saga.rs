//! In-memory saga repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use herald_common::{SagaInstance, SagaState};

use crate::contracts::SagaRepository;
use crate::error::StorageResult;

/// DashMap-backed saga repository. The version check in `save` runs
/// under the entry lock, which is what makes the optimistic update
/// atomic: two writers racing from the same version see exactly one
/// winner.
pub struct InMemorySagaRepository<S: SagaState> {
    instances: DashMap<String, SagaInstance<S>>,
}

impl<S: SagaState> InMemorySagaRepository<S> {
    pub fn new() -> Self {
        Self { instances: DashMap::new() }
    }
}

impl<S: SagaState> Default for InMemorySagaRepository<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: SagaState> SagaRepository<S> for InMemorySagaRepository<S> {
    async fn load(&self, correlation_id: &str) -> StorageResult<Option<SagaInstance<S>>> {
        Ok(self.instances.get(correlation_id).map(|instance| instance.clone()))
    }

    async fn save(&self, saga: &SagaInstance<S>, expected_version: u64) -> StorageResult<bool> {
        match self.instances.entry(saga.correlation_id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if expected_version != 0 {
                    return Ok(false);
                }
                let mut stored = saga.clone();
                stored.version = 1;
                slot.insert(stored);
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().version != expected_version {
                    return Ok(false);
                }
                let mut stored = saga.clone();
                stored.version = expected_version + 1;
                slot.insert(stored);
                Ok(true)
            }
        }
    }

    async fn get_expired(&self, now: DateTime<Utc>) -> StorageResult<Vec<SagaInstance<S>>> {
        Ok(self
            .instances
            .iter()
            .filter(|instance| {
                !instance.is_completed && instance.timeout_at.map_or(false, |at| at <= now)
            })
            .map(|instance| instance.clone())
            .collect())
    }
}
