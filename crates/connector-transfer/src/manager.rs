// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer process manager.
//!
//! Registers one processor per state the connector drives on its own:
//!
//! | Processor | From | To (success) | On failure |
//! |-----------|------|--------------|------------|
//! | `initial` | INITIAL | STARTING | unknown asset: TERMINATED |
//! | `starting` | STARTING | STARTED | transient: retry STARTING, permanent or exhausted: TERMINATED |
//! | `completing` | COMPLETING | COMPLETED | retry COMPLETING, exhausted: TERMINATED |
//! | `terminating` | TERMINATING | TERMINATED | retry TERMINATING, exhausted: TERMINATED |
//!
//! STARTED has no processor: it stays put until [`TransferProcessManager::complete`]
//! or [`TransferProcessManager::terminate`] is called.
//!
//! The three retrying processors fetch through
//! [`StateEntityManager::processor_for_state_with_backoff`], so a process waiting
//! out its retry delay never takes a batch slot.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use connector_core::{
    EngineError, EntityRetryPolicy, FailureOutcome, FailurePolicy, Processor,
    StateEntityManager, StatefulEntity,
};

use crate::collaborators::{AssetIndex, DataFlowController, DataFlowError};
use crate::process::{TransferProcess, TransferProcessState, TransferRequest};

/// Errors returned by the transfer process API.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The requested operation is not allowed in the process's current state.
    #[error("Transfer process '{id}' is {state}, cannot {operation}")]
    InvalidState {
        id: String,
        state: String,
        operation: &'static str,
    },
}

impl TransferError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Engine(e) => e.error_code(),
            Self::InvalidState { .. } => "INVALID_STATE",
        }
    }
}

struct Inner {
    entities: StateEntityManager<TransferProcess>,
    assets: Arc<dyn AssetIndex>,
    data_flow: Arc<dyn DataFlowController>,
    retry: EntityRetryPolicy,
}

/// Drives transfer processes through their lifecycle.
#[derive(Clone)]
pub struct TransferProcessManager {
    inner: Arc<Inner>,
}

impl TransferProcessManager {
    /// Create a stopped manager. Retry limits come from the entity manager's config.
    pub fn new(
        entities: StateEntityManager<TransferProcess>,
        assets: Arc<dyn AssetIndex>,
        data_flow: Arc<dyn DataFlowController>,
    ) -> Self {
        let retry = entities.config().retry_policy();
        Self {
            inner: Arc::new(Inner {
                entities,
                assets,
                data_flow,
                retry,
            }),
        }
    }

    /// Start the processing loop.
    pub fn start(&self) -> Result<(), TransferError> {
        self.inner.entities.start(self.processors())?;
        info!(manager = %self.inner.entities.name(), "Transfer process manager started");
        Ok(())
    }

    /// Stop the processing loop, waiting for the in-flight iteration.
    pub async fn stop(&self) -> Result<(), TransferError> {
        self.inner.entities.stop().await?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.entities.is_running()
    }

    /// The processors `start` registers, in loop order.
    pub fn processors(&self) -> Vec<Box<dyn Processor>> {
        let entities = &self.inner.entities;

        let inner = self.inner.clone();
        let initial = entities.processor_for_state(
            "initial",
            TransferProcessState::Initial.code(),
            move |process| {
                let inner = inner.clone();
                async move { inner.process_initial(process).await }
            },
        );

        let inner = self.inner.clone();
        let starting = entities.processor_for_state_with_backoff(
            "starting",
            TransferProcessState::Starting.code(),
            move |process| {
                let inner = inner.clone();
                async move { inner.process_starting(process).await }
            },
        );

        let inner = self.inner.clone();
        let completing = entities.processor_for_state_with_backoff(
            "completing",
            TransferProcessState::Completing.code(),
            move |process| {
                let inner = inner.clone();
                async move {
                    inner
                        .process_stopping(process, TransferProcessState::Completed)
                        .await
                }
            },
        );

        let inner = self.inner.clone();
        let terminating = entities.processor_for_state_with_backoff(
            "terminating",
            TransferProcessState::Terminating.code(),
            move |process| {
                let inner = inner.clone();
                async move {
                    inner
                        .process_stopping(process, TransferProcessState::Terminated)
                        .await
                }
            },
        );

        vec![
            Box::new(initial),
            Box::new(starting),
            Box::new(completing),
            Box::new(terminating),
        ]
    }

    /// Create a process in INITIAL and return its id.
    pub async fn initiate(&self, request: TransferRequest) -> Result<String, TransferError> {
        let entities = &self.inner.entities;
        let mut process = TransferProcess::from_request(request, entities.clock().now());
        entities.create(&mut process).await?;

        info!(
            entity_id = %process.id(),
            asset_id = %process.asset_id,
            counter_party = %process.counter_party_address,
            "Transfer process initiated"
        );
        Ok(process.core.id)
    }

    /// Request completion of a STARTED process.
    ///
    /// Fails with `LeaseConflict` while another holder is working on it.
    pub async fn complete(&self, id: &str) -> Result<(), TransferError> {
        let entities = &self.inner.entities;
        let mut process = entities.store().find_by_id_and_lease(id).await?;

        let state = process.process_state();
        if state != Some(TransferProcessState::Started) {
            entities.break_lease(&process).await?;
            return Err(invalid_state(&process, "complete"));
        }

        process.transition(TransferProcessState::Completing, entities.clock().now());
        entities.update(&mut process).await?;
        info!(entity_id = %id, "Transfer process completing");
        Ok(())
    }

    /// Request termination of a process that has not finished yet.
    pub async fn terminate(&self, id: &str, reason: &str) -> Result<(), TransferError> {
        let entities = &self.inner.entities;
        let mut process = entities.store().find_by_id_and_lease(id).await?;

        let terminable = match process.process_state() {
            Some(state) => !state.is_final() && state != TransferProcessState::Terminating,
            None => false,
        };
        if !terminable {
            entities.break_lease(&process).await?;
            return Err(invalid_state(&process, "terminate"));
        }

        process.transition_to_error(
            TransferProcessState::Terminating.code(),
            reason,
            entities.clock().now(),
        );
        process.termination_reason = Some(reason.to_string());
        entities.update(&mut process).await?;
        info!(entity_id = %id, reason, "Transfer process terminating");
        Ok(())
    }

    /// Current stored version of a process, without leasing it.
    pub async fn find(&self, id: &str) -> Result<Option<TransferProcess>, TransferError> {
        Ok(self.inner.entities.store().find_by_id(id).await?)
    }
}

fn invalid_state(process: &TransferProcess, operation: &'static str) -> TransferError {
    let state = match process.process_state() {
        Some(state) => state.to_string(),
        None => process.state().to_string(),
    };
    TransferError::InvalidState {
        id: process.id().to_string(),
        state,
        operation,
    }
}

impl Inner {
    async fn process_initial(&self, mut process: TransferProcess) -> connector_core::Result<bool> {
        let known = self
            .assets
            .contains(&process.asset_id)
            .await
            .map_err(|e| EngineError::Processing {
                entity_id: process.id().to_string(),
                reason: format!("asset lookup failed: {:#}", e),
            })?;

        let now = self.entities.clock().now();
        if !known {
            let detail = format!("Asset '{}' not found", process.asset_id);
            warn!(entity_id = %process.id(), asset_id = %process.asset_id, "Unknown asset, terminating");
            FailurePolicy::Terminate.apply(
                &mut process,
                TransferProcessState::Terminated.code(),
                detail,
                now,
            );
        } else {
            process.transition(TransferProcessState::Starting, now);
        }

        self.entities.update(&mut process).await?;
        Ok(true)
    }

    async fn process_starting(&self, mut process: TransferProcess) -> connector_core::Result<bool> {
        let result = self.data_flow.start(&process).await;
        let now = self.entities.clock().now();
        match result {
            Ok(()) => {
                process.transition(TransferProcessState::Started, now);
                info!(entity_id = %process.id(), "Data flow started");
            }
            Err(DataFlowError::Transient(detail)) => {
                self.fail(&mut process, FailurePolicy::Retry(self.retry.clone()), detail);
            }
            Err(DataFlowError::Permanent(detail)) => {
                self.fail(&mut process, FailurePolicy::Terminate, detail);
            }
        }

        self.entities.update(&mut process).await?;
        Ok(true)
    }

    /// COMPLETING and TERMINATING both stop the data flow before finishing.
    async fn process_stopping(
        &self,
        mut process: TransferProcess,
        target: TransferProcessState,
    ) -> connector_core::Result<bool> {
        let result = self.data_flow.stop(&process).await;
        let now = self.entities.clock().now();
        match result {
            Ok(()) => {
                process.transition(target, now);
                if target == TransferProcessState::Terminated {
                    process.core.error_detail = process.termination_reason.clone();
                }
                info!(entity_id = %process.id(), state = %target, "Transfer process finished");
            }
            Err(e) => {
                let detail = match &process.termination_reason {
                    Some(reason) => format!("{}; stop failed: {}", reason, e),
                    None => e.to_string(),
                };
                self.fail(&mut process, FailurePolicy::Retry(self.retry.clone()), detail);
            }
        }

        self.entities.update(&mut process).await?;
        Ok(true)
    }

    fn fail(&self, process: &mut TransferProcess, policy: FailurePolicy, detail: String) {
        let attempt = process.state_count();
        let from = process.state();
        let outcome = policy.apply(
            process,
            TransferProcessState::Terminated.code(),
            detail.as_str(),
            self.entities.clock().now(),
        );

        match outcome {
            FailureOutcome::RetrySameState => warn!(
                entity_id = %process.id(),
                state = from,
                attempt,
                error = %detail,
                "Transfer step failed, will retry"
            ),
            FailureOutcome::Terminate => warn!(
                entity_id = %process.id(),
                state = from,
                attempt,
                error = %detail,
                "Transfer step failed, terminating"
            ),
        }
    }
}
