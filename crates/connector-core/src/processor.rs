// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch processors driven by the state machine loop.
//!
//! A [`StateProcessor`] binds three functions:
//! - fetch: pulls a leased batch (typically `store.next_not_leased(batch, criterion)`)
//! - process: handles one entity, `Ok(true)` when it advanced the entity
//! - on_not_processed: called for entities the process function declined
//!   (`Ok(false)`); breaks the lease unless overridden
//!
//! Every entity's lease is resolved exactly once per pass. A process function
//! that errors or panics is contained here: the failure is logged and the
//! lease broken so the entity is retried on a later iteration.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::entity::StatefulEntity;
use crate::error::Result;
use crate::lease::LeaseContext;
use crate::telemetry::Telemetry;

/// One unit of work the state machine loop invokes per iteration.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Fetch and process one batch. Returns the number of entities advanced.
    ///
    /// Never fails: storage and processing errors are logged and count as no progress.
    async fn process(&self) -> usize;
}

type FetchFn<E> = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<E>>> + Send + Sync>;
type ProcessFn<E> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<bool>> + Send + Sync>;
type FallbackFn<E> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// [`Processor`] over one fetch function and one per-entity function.
pub struct StateProcessor<E> {
    name: String,
    lease_context: Arc<dyn LeaseContext>,
    fetch: FetchFn<E>,
    process: ProcessFn<E>,
    on_not_processed: Option<FallbackFn<E>>,
    telemetry: Telemetry,
}

impl<E: StatefulEntity> StateProcessor<E> {
    /// Build a processor. `lease_context` is used to break leases on failure and
    /// by the default not-processed fallback.
    pub fn new<F, FFut, P, PFut>(
        name: impl Into<String>,
        lease_context: Arc<dyn LeaseContext>,
        fetch: F,
        process: P,
    ) -> Self
    where
        F: Fn() -> FFut + Send + Sync + 'static,
        FFut: Future<Output = Result<Vec<E>>> + Send + 'static,
        P: Fn(E) -> PFut + Send + Sync + 'static,
        PFut: Future<Output = Result<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            lease_context,
            fetch: Arc::new(move || fetch().boxed()),
            process: Arc::new(move |entity| process(entity).boxed()),
            on_not_processed: None,
            telemetry: Telemetry::default(),
        }
    }

    /// Replace the default fallback (break the lease) for declined entities.
    pub fn on_not_processed<G, GFut>(mut self, fallback: G) -> Self
    where
        G: Fn(E) -> GFut + Send + Sync + 'static,
        GFut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_not_processed = Some(Arc::new(move |entity| fallback(entity).boxed()));
        self
    }

    /// Run each entity's process function inside a span carrying its trace context.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    async fn handle(&self, entity: E) -> bool {
        let entity_id = entity.id().to_string();
        let state = entity.state();

        let fut = (self.process)(entity.clone());
        let outcome = AssertUnwindSafe(self.telemetry.instrument(&entity, fut))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                debug!(
                    processor = %self.name,
                    entity_id = %entity_id,
                    state,
                    "Entity not processed"
                );
                self.not_processed(entity).await;
                false
            }
            Ok(Err(e)) => {
                error!(
                    processor = %self.name,
                    entity_id = %entity_id,
                    state,
                    error = %e,
                    error_code = e.error_code(),
                    "Failed to process entity"
                );
                self.release(&entity_id).await;
                false
            }
            Err(panic) => {
                error!(
                    processor = %self.name,
                    entity_id = %entity_id,
                    state,
                    panic = %panic_message(panic.as_ref()),
                    "Processing function panicked"
                );
                self.release(&entity_id).await;
                false
            }
        }
    }

    async fn not_processed(&self, entity: E) {
        match &self.on_not_processed {
            Some(fallback) => {
                let entity_id = entity.id().to_string();
                if let Err(e) = fallback(entity).await {
                    warn!(
                        processor = %self.name,
                        entity_id = %entity_id,
                        error = %e,
                        "Not-processed fallback failed"
                    );
                }
            }
            None => self.release(entity.id()).await,
        }
    }

    async fn release(&self, entity_id: &str) {
        if let Err(e) = self.lease_context.break_lease(entity_id).await {
            if e.is_lease_conflict() {
                debug!(
                    processor = %self.name,
                    entity_id = %entity_id,
                    "Lease already taken over, not breaking"
                );
            } else {
                warn!(
                    processor = %self.name,
                    entity_id = %entity_id,
                    error = %e,
                    "Failed to break lease"
                );
            }
        }
    }
}

#[async_trait]
impl<E: StatefulEntity> Processor for StateProcessor<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self) -> usize {
        let batch = match (self.fetch)().await {
            Ok(batch) => batch,
            Err(e) => {
                error!(
                    processor = %self.name,
                    error = %e,
                    error_code = e.error_code(),
                    "Failed to fetch entities"
                );
                return 0;
            }
        };

        let mut processed = 0;
        for entity in batch {
            if self.handle(entity).await {
                processed += 1;
            }
        }
        processed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
