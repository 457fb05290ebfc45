// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store and lease context.
//!
//! All entities and leases of one kind live behind a single mutex, which makes
//! every operation (including select-and-lock) atomic. Several stores with
//! different holders can share one [`InMemoryBackend`] to simulate connector
//! instances sharing a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::{Lease, LeaseContext};
use crate::store::{Criterion, StateEntityStore};

struct MemoryState<E> {
    entities: HashMap<String, E>,
    leases: HashMap<String, Lease>,
}

impl<E> MemoryState<E> {
    fn has_live_lease(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.leases
            .get(id)
            .map(|lease| !lease.is_expired(now))
            .unwrap_or(false)
    }

    fn try_acquire(
        &mut self,
        id: &str,
        holder: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        if let Some(existing) = self.leases.get(id)
            && !existing.is_expired(now)
            && !existing.is_held_by(holder)
        {
            return Err(EngineError::lease_conflict(id, &existing.lease_holder));
        }

        let lease = Lease {
            entity_id: id.to_string(),
            lease_holder: holder.to_string(),
            leased_at: now,
            lease_duration: duration,
        };
        self.leases.insert(id.to_string(), lease.clone());
        Ok(lease)
    }
}

/// Shared backing state for one entity kind.
pub struct InMemoryBackend<E> {
    state: Arc<Mutex<MemoryState<E>>>,
}

impl<E> Clone for InMemoryBackend<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<E: StatefulEntity> Default for InMemoryBackend<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: StatefulEntity> InMemoryBackend<E> {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                entities: HashMap::new(),
                leases: HashMap::new(),
            })),
        }
    }

    /// Open a store on this backend for `holder`.
    pub fn store(
        &self,
        holder: impl Into<String>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> InMemoryStore<E> {
        InMemoryStore {
            state: self.state.clone(),
            lease_context: Arc::new(InMemoryLeaseContext {
                state: self.state.clone(),
                holder: holder.into(),
                lease_duration,
                clock: clock.clone(),
            }),
            clock,
        }
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        lock(&self.state).entities.len()
    }

    /// Whether the backend holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<E>(state: &Mutex<MemoryState<E>>) -> MutexGuard<'_, MemoryState<E>> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Lease context over an [`InMemoryBackend`].
pub struct InMemoryLeaseContext<E> {
    state: Arc<Mutex<MemoryState<E>>>,
    holder: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl<E: StatefulEntity> LeaseContext for InMemoryLeaseContext<E> {
    fn holder(&self) -> &str {
        &self.holder
    }

    async fn acquire_lease(&self, entity_id: &str) -> Result<Lease> {
        let now = self.clock.now();
        lock(&self.state).try_acquire(entity_id, &self.holder, self.lease_duration, now)
    }

    async fn break_lease(&self, entity_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        match state.leases.get(entity_id) {
            None => Ok(()),
            Some(lease) if lease.is_held_by(&self.holder) => {
                state.leases.remove(entity_id);
                Ok(())
            }
            Some(lease) if lease.is_expired(now) => Ok(()),
            Some(lease) => Err(EngineError::lease_conflict(entity_id, &lease.lease_holder)),
        }
    }

    async fn force_break_lease(&self, entity_id: &str) -> Result<()> {
        lock(&self.state).leases.remove(entity_id);
        Ok(())
    }

    async fn get_lease(&self, entity_id: &str) -> Result<Option<Lease>> {
        Ok(lock(&self.state).leases.get(entity_id).cloned())
    }
}

/// [`StateEntityStore`] over an [`InMemoryBackend`].
pub struct InMemoryStore<E> {
    state: Arc<Mutex<MemoryState<E>>>,
    lease_context: Arc<InMemoryLeaseContext<E>>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl<E: StatefulEntity> StateEntityStore<E> for InMemoryStore<E> {
    async fn next_not_leased(&self, limit: usize, criterion: &Criterion) -> Result<Vec<E>> {
        let now = self.clock.now();
        let ctx = &self.lease_context;
        let mut state = lock(&self.state);

        let mut candidates: Vec<(DateTime<Utc>, String)> = state
            .entities
            .values()
            .filter(|e| criterion.matches(e.state()))
            .filter(|e| !state.has_live_lease(e.id(), now))
            .map(|e| (e.core().state_timestamp, e.id().to_string()))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut batch = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            state.try_acquire(&id, &ctx.holder, ctx.lease_duration, now)?;
            if let Some(entity) = state.entities.get(&id) {
                batch.push(entity.clone());
            }
        }
        Ok(batch)
    }

    async fn create(&self, entity: &E) -> Result<()> {
        let mut state = lock(&self.state);
        if state.entities.contains_key(entity.id()) {
            return Err(EngineError::EntityAlreadyExists {
                entity_id: entity.id().to_string(),
            });
        }
        state
            .entities
            .insert(entity.id().to_string(), entity.clone());
        Ok(())
    }

    async fn save(&self, entity: &E) -> Result<()> {
        lock(&self.state)
            .entities
            .insert(entity.id().to_string(), entity.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<E>> {
        Ok(lock(&self.state).entities.get(id).cloned())
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<E> {
        let now = self.clock.now();
        let ctx = &self.lease_context;
        let mut state = lock(&self.state);
        let entity = state
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(id))?;
        state.try_acquire(id, &ctx.holder, ctx.lease_duration, now)?;
        Ok(entity)
    }

    fn lease_context(&self) -> Arc<dyn LeaseContext> {
        self.lease_context.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::tests::TestEntity;

    const STARTED: i32 = 100;
    const COMPLETED: i32 = 200;

    fn setup() -> (InMemoryBackend<TestEntity>, Arc<ManualClock>) {
        (
            InMemoryBackend::new(),
            Arc::new(ManualClock::at_millis(1_000_000)),
        )
    }

    #[tokio::test]
    async fn test_single_entity_happy_path() {
        let (backend, clock) = setup();
        let store = backend.store("node-a", Duration::from_secs(60), clock.clone());

        let entity = TestEntity::new("e-1", STARTED, clock.now());
        store.create(&entity).await.unwrap();

        let batch = store
            .next_not_leased(10, &Criterion::StateIs(STARTED))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        let lease = store.lease_context().get_lease("e-1").await.unwrap().unwrap();
        assert_eq!(lease.lease_holder, "node-a");

        let mut entity = batch.into_iter().next().unwrap();
        entity.transition_to(COMPLETED, clock.now());
        store.save(&entity).await.unwrap();
        store.lease_context().break_lease("e-1").await.unwrap();

        let batch = store
            .next_not_leased(10, &Criterion::StateIs(STARTED))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(store.lease_context().get_lease("e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let (backend, clock) = setup();
        let store = backend.store("node-a", Duration::from_secs(60), clock.clone());
        let entity = TestEntity::new("e-1", STARTED, clock.now());

        store.create(&entity).await.unwrap();
        let err = store.create(&entity).await.unwrap_err();
        assert!(matches!(err, EngineError::EntityAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_break_lease_of_other_holder_conflicts() {
        let (backend, clock) = setup();
        let a = backend.store("node-a", Duration::from_secs(60), clock.clone());
        let b = backend.store("node-b", Duration::from_secs(60), clock.clone());

        a.lease_context().acquire_lease("e-1").await.unwrap();
        let err = b.lease_context().break_lease("e-1").await.unwrap_err();
        assert!(err.is_lease_conflict());

        // absent lease is a no-op
        b.lease_context().break_lease("e-2").await.unwrap();

        b.lease_context().force_break_lease("e-1").await.unwrap();
        assert!(a.lease_context().get_lease("e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_id_and_lease() {
        let (backend, clock) = setup();
        let a = backend.store("node-a", Duration::from_secs(60), clock.clone());
        let b = backend.store("node-b", Duration::from_secs(60), clock.clone());
        a.create(&TestEntity::new("e-1", STARTED, clock.now()))
            .await
            .unwrap();

        let entity = a.find_by_id_and_lease("e-1").await.unwrap();
        assert_eq!(entity.id(), "e-1");

        let err = b.find_by_id_and_lease("e-1").await.unwrap_err();
        assert!(err.is_lease_conflict());

        let err = b.find_by_id_and_lease("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::EntityNotFound { .. }));
    }
}
