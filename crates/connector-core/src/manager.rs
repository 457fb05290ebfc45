// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared infrastructure for business entity managers.
//!
//! A business manager (transfer processes, negotiations, ...) holds a
//! [`StateEntityManager`] and registers one processor per state it owns:
//!
//! ```rust,ignore
//! let manager = StateEntityManager::new("transfer-process", store, clock, config);
//! let started = manager.processor_for_state("started", STARTED, move |entity| { ... });
//! manager.start(vec![Box::new(started)])?;
//! // ...
//! manager.stop().await?;
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::EntityManagerConfig;
use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::processor::{Processor, StateProcessor};
use crate::retry::EntityRetryPolicy;
use crate::state_machine::{StateMachineConfig, StateMachineManager};
use crate::store::{Criterion, StateEntityStore};
use crate::telemetry::Telemetry;
use crate::wait::WaitStrategy;

/// Store, clock, telemetry and loop lifecycle for one entity kind.
pub struct StateEntityManager<E: StatefulEntity> {
    name: String,
    store: Arc<dyn StateEntityStore<E>>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
    config: EntityManagerConfig,
    state_machine: Mutex<Option<StateMachineManager>>,
}

impl<E: StatefulEntity> StateEntityManager<E> {
    /// Create a stopped manager named `name` for logs and the loop task.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn StateEntityStore<E>>,
        clock: Arc<dyn Clock>,
        config: EntityManagerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            clock,
            telemetry: Telemetry::default(),
            config,
            state_machine: Mutex::new(None),
        }
    }

    /// Use `telemetry` for trace capture and per-entity spans.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Manager name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn StateEntityStore<E>> {
        &self.store
    }

    /// Clock used for timestamps and lease expiry.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Telemetry handle shared with the processors.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Batch, loop and retry settings.
    pub fn config(&self) -> &EntityManagerConfig {
        &self.config
    }

    /// Start the loop with the configured exponential idle back-off.
    pub fn start(&self, processors: Vec<Box<dyn Processor>>) -> Result<()> {
        self.start_with(processors, Box::new(self.config.wait_strategy()))
    }

    /// Start the loop with an explicit wait strategy.
    pub fn start_with(
        &self,
        processors: Vec<Box<dyn Processor>>,
        wait_strategy: Box<dyn WaitStrategy>,
    ) -> Result<()> {
        let mut slot = self.state_machine.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = slot.as_ref()
            && current.is_running()
        {
            return Err(EngineError::AlreadyRunning(self.name.clone()));
        }

        let state_machine = StateMachineManager::new(
            StateMachineConfig::new(self.name.clone()),
            processors,
            wait_strategy,
        );
        state_machine.start()?;
        *slot = Some(state_machine);
        Ok(())
    }

    /// Stop the loop, waiting for the in-flight iteration. No-op when stopped.
    pub async fn stop(&self) -> Result<()> {
        let state_machine = self
            .state_machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match state_machine {
            Some(state_machine) => state_machine.stop().await,
            None => Ok(()),
        }
    }

    /// Whether the loop task is running.
    pub fn is_running(&self) -> bool {
        self.state_machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(StateMachineManager::is_running)
            .unwrap_or(false)
    }

    /// Insert a new entity, stamping the current trace context if it has none.
    pub async fn create(&self, entity: &mut E) -> Result<()> {
        if entity.core().trace_context.is_empty() {
            entity.core_mut().trace_context = self.telemetry.capture();
        }
        self.store.create(entity).await
    }

    /// Persist a just-transitioned entity and release its lease.
    pub async fn update(&self, entity: &mut E) -> Result<()> {
        entity.core_mut().touch(self.clock.now());
        self.store.save(entity).await?;
        self.store.lease_context().break_lease(entity.id()).await?;
        debug!(
            manager = %self.name,
            entity_id = %entity.id(),
            state = entity.state(),
            state_count = entity.state_count(),
            "Entity updated"
        );
        Ok(())
    }

    /// Release the entity's lease without changing it.
    pub async fn break_lease(&self, entity: &E) -> Result<()> {
        self.store.lease_context().break_lease(entity.id()).await
    }

    /// Processor over entities in `state`, fetched `batch_size` at a time, with
    /// the default break-lease fallback.
    pub fn processor_for_state<F, Fut>(
        &self,
        name: impl Into<String>,
        state: i32,
        process: F,
    ) -> StateProcessor<E>
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let store = self.store.clone();
        let batch_size = self.config.batch_size;
        let criterion = Criterion::StateIs(state);

        StateProcessor::new(
            name,
            self.store.lease_context(),
            move || {
                let store = store.clone();
                let criterion = criterion.clone();
                async move { store.next_not_leased(batch_size, &criterion).await }
            },
            process,
        )
        .with_telemetry(self.telemetry.clone())
    }

    /// Like [`processor_for_state`](Self::processor_for_state), but entities
    /// still inside their retry back-off are left out of the batch.
    ///
    /// Backing-off entities keep their old `state_timestamp` and would otherwise
    /// fill every batch ahead of newer entities. The fetch looks past them, up
    /// to a few batches deep, and releases their leases before processing.
    pub fn processor_for_state_with_backoff<F, Fut>(
        &self,
        name: impl Into<String>,
        state: i32,
        process: F,
    ) -> StateProcessor<E>
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let retry = self.config.retry_policy();
        let batch_size = self.config.batch_size;
        let criterion = Criterion::StateIs(state);

        StateProcessor::new(
            name,
            self.store.lease_context(),
            move || {
                let store = store.clone();
                let clock = clock.clone();
                let retry = retry.clone();
                let criterion = criterion.clone();
                async move {
                    next_ready(store.as_ref(), clock.as_ref(), &retry, batch_size, &criterion)
                        .await
                }
            },
            process,
        )
        .with_telemetry(self.telemetry.clone())
    }
}

/// Upper bound on fetches per pass when skipping backing-off entities.
const MAX_READY_FETCHES: usize = 8;

/// Lease up to `batch_size` entities matching `criterion` that are not backing off.
///
/// Delayed entities stay leased until the end so later fetches skip them.
async fn next_ready<E: StatefulEntity>(
    store: &dyn StateEntityStore<E>,
    clock: &dyn Clock,
    retry: &EntityRetryPolicy,
    batch_size: usize,
    criterion: &Criterion,
) -> Result<Vec<E>> {
    let mut ready = Vec::with_capacity(batch_size);
    let mut delayed = Vec::new();
    let mut fetch_error = None;

    for _ in 0..MAX_READY_FETCHES {
        let wanted = batch_size.saturating_sub(ready.len());
        if wanted == 0 {
            break;
        }
        let batch = match store.next_not_leased(wanted, criterion).await {
            Ok(batch) => batch,
            Err(e) => {
                fetch_error = Some(e);
                break;
            }
        };
        if batch.is_empty() {
            break;
        }

        let now = clock.now();
        for entity in batch {
            if retry.should_delay(&entity, now) {
                delayed.push(entity.id().to_string());
            } else {
                ready.push(entity);
            }
        }
    }

    let lease_context = store.lease_context();
    for entity_id in &delayed {
        if let Err(e) = lease_context.break_lease(entity_id).await {
            warn!(entity_id = %entity_id, error = %e, "Failed to release backing-off entity");
        }
    }
    if !delayed.is_empty() {
        debug!(delayed = delayed.len(), ready = ready.len(), "Skipped entities in retry back-off");
    }

    match fetch_error {
        Some(e) if ready.is_empty() => Err(e),
        Some(e) => {
            warn!(error = %e, ready = ready.len(), "Fetch failed, processing partial batch");
            Ok(ready)
        }
        None => Ok(ready),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, from_millis};
    use crate::entity::tests::TestEntity;
    use crate::persistence::InMemoryBackend;
    use crate::telemetry::TRACEPARENT;
    use crate::wait::FixedWaitStrategy;
    use std::time::Duration;

    const STARTED: i32 = 100;
    const COMPLETED: i32 = 200;

    fn manager(
        clock: Arc<ManualClock>,
    ) -> (Arc<StateEntityManager<TestEntity>>, InMemoryBackend<TestEntity>) {
        let backend = InMemoryBackend::new();
        let store = Arc::new(backend.store("node-a", Duration::from_secs(60), clock.clone()));
        let config = EntityManagerConfig {
            batch_size: 2,
            ..Default::default()
        };
        (
            Arc::new(StateEntityManager::new("test", store, clock, config)),
            backend,
        )
    }

    #[tokio::test]
    async fn test_create_stamps_trace_context() {
        let clock = Arc::new(ManualClock::at_millis(0));
        let (manager, backend) = manager(clock.clone());

        let mut entity = TestEntity::new("e-1", STARTED, from_millis(0));
        manager.create(&mut entity).await.unwrap();

        assert!(entity.core.trace_context.contains_key(TRACEPARENT));
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_update_saves_and_releases() {
        let clock = Arc::new(ManualClock::at_millis(0));
        let (manager, _backend) = manager(clock.clone());
        let mut entity = TestEntity::new("e-1", STARTED, from_millis(0));
        manager.create(&mut entity).await.unwrap();

        let mut leased = manager.store().find_by_id_and_lease("e-1").await.unwrap();
        clock.advance(Duration::from_secs(5));
        leased.transition_to(COMPLETED, manager.clock().now());
        manager.update(&mut leased).await.unwrap();

        let stored = manager.store().find_by_id("e-1").await.unwrap().unwrap();
        assert_eq!(stored.state(), COMPLETED);
        assert_eq!(stored.core.updated_at, from_millis(5_000));
        let ctx = manager.store().lease_context();
        assert!(ctx.get_lease("e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_break_lease_keeps_entity_unchanged() {
        let clock = Arc::new(ManualClock::at_millis(0));
        let (manager, _backend) = manager(clock.clone());
        let mut entity = TestEntity::new("e-1", STARTED, from_millis(0));
        manager.create(&mut entity).await.unwrap();

        let leased = manager.store().find_by_id_and_lease("e-1").await.unwrap();
        manager.break_lease(&leased).await.unwrap();

        let stored = manager.store().find_by_id("e-1").await.unwrap().unwrap();
        assert_eq!(stored, entity);
        let ctx = manager.store().lease_context();
        assert!(ctx.get_lease("e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_processor_for_state_drains_in_batches() {
        let clock = Arc::new(ManualClock::at_millis(0));
        let (manager, _backend) = manager(clock.clone());
        for i in 0..5 {
            let mut entity = TestEntity::new(&format!("e-{}", i), STARTED, from_millis(i));
            manager.create(&mut entity).await.unwrap();
        }

        let inner = manager.clone();
        let processor = manager.processor_for_state("started", STARTED, move |mut entity| {
            let manager = inner.clone();
            async move {
                entity.transition_to(COMPLETED, manager.clock().now());
                manager.update(&mut entity).await?;
                Ok::<_, EngineError>(true)
            }
        });

        assert_eq!(processor.process().await, 2);
        assert_eq!(processor.process().await, 2);
        assert_eq!(processor.process().await, 1);
        assert_eq!(processor.process().await, 0);
    }

    #[tokio::test]
    async fn test_backoff_processor_skips_delayed_entities() {
        let clock = Arc::new(ManualClock::at_millis(500));
        let (manager, _backend) = manager(clock.clone());
        for i in 0..3 {
            // second attempt in STARTED, ready at 1s
            let mut entity = TestEntity::new(&format!("retry-{}", i), STARTED, from_millis(0));
            entity.transition_to(STARTED, from_millis(0));
            manager.create(&mut entity).await.unwrap();
        }
        for i in 0..2 {
            let mut entity = TestEntity::new(&format!("fresh-{}", i), STARTED, from_millis(100 + i));
            manager.create(&mut entity).await.unwrap();
        }

        let inner = manager.clone();
        let processor =
            manager.processor_for_state_with_backoff("started", STARTED, move |mut entity| {
                let manager = inner.clone();
                async move {
                    entity.transition_to(COMPLETED, manager.clock().now());
                    manager.update(&mut entity).await?;
                    Ok::<_, EngineError>(true)
                }
            });

        assert_eq!(processor.process().await, 2);
        for i in 0..2 {
            let fresh = manager.store().find_by_id(&format!("fresh-{}", i)).await.unwrap();
            assert_eq!(fresh.unwrap().state(), COMPLETED);
        }
        let ctx = manager.store().lease_context();
        for i in 0..3 {
            assert!(ctx.get_lease(&format!("retry-{}", i)).await.unwrap().is_none());
        }
        assert_eq!(processor.process().await, 0);

        clock.advance(Duration::from_millis(500));
        assert_eq!(processor.process().await, 2);
        assert_eq!(processor.process().await, 1);
        assert_eq!(processor.process().await, 0);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let clock = Arc::new(ManualClock::at_millis(0));
        let (manager, _backend) = manager(clock);

        manager
            .start_with(vec![], Box::new(FixedWaitStrategy::new(Duration::from_millis(5))))
            .unwrap();
        assert!(manager.is_running());
        assert!(matches!(
            manager.start(vec![]),
            Err(EngineError::AlreadyRunning(_))
        ));

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        manager.stop().await.unwrap();
    }
}
