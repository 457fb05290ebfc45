// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External collaborators of the transfer process manager.
//!
//! The manager only needs to know whether an asset exists and how to start
//! and stop the data flow. Production deployments plug in catalog and data
//! plane clients; the in-memory versions here back the tests and the daemon.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

use crate::process::TransferProcess;

/// Lookup of assets that may be transferred.
#[async_trait]
pub trait AssetIndex: Send + Sync {
    /// Whether `asset_id` is known. Lookup failures are transient.
    async fn contains(&self, asset_id: &str) -> anyhow::Result<bool>;
}

/// Failure reported by the data plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataFlowError {
    /// Retrying may succeed (data plane busy or unreachable).
    #[error("transient data flow failure: {0}")]
    Transient(String),

    /// Retrying cannot succeed (destination rejected, unsupported type).
    #[error("permanent data flow failure: {0}")]
    Permanent(String),
}

/// Starts and stops the actual movement of data for a process.
#[async_trait]
pub trait DataFlowController: Send + Sync {
    async fn start(&self, process: &TransferProcess) -> Result<(), DataFlowError>;

    async fn stop(&self, process: &TransferProcess) -> Result<(), DataFlowError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fixed set of asset ids.
#[derive(Debug, Default)]
pub struct InMemoryAssetIndex {
    assets: Mutex<HashSet<String>>,
}

impl InMemoryAssetIndex {
    pub fn new<I, S>(assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            assets: Mutex::new(assets.into_iter().map(Into::into).collect()),
        }
    }

    pub fn insert(&self, asset_id: impl Into<String>) {
        lock(&self.assets).insert(asset_id.into());
    }
}

#[async_trait]
impl AssetIndex for InMemoryAssetIndex {
    async fn contains(&self, asset_id: &str) -> anyhow::Result<bool> {
        Ok(lock(&self.assets).contains(asset_id))
    }
}

/// Records start/stop calls and fails starts on demand.
#[derive(Debug, Default)]
pub struct InMemoryDataFlowController {
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    start_failures: Mutex<VecDeque<DataFlowError>>,
    stop_failures: Mutex<VecDeque<DataFlowError>>,
}

impl InMemoryDataFlowController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start` call fail with `error`. Failures queue up.
    pub fn fail_next_start(&self, error: DataFlowError) {
        lock(&self.start_failures).push_back(error);
    }

    /// Make the next `stop` call fail with `error`. Failures queue up.
    pub fn fail_next_stop(&self, error: DataFlowError) {
        lock(&self.stop_failures).push_back(error);
    }

    /// Ids of processes whose data flow was started, in call order.
    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    /// Ids of processes whose data flow was stopped, in call order.
    pub fn stopped(&self) -> Vec<String> {
        lock(&self.stopped).clone()
    }
}

#[async_trait]
impl DataFlowController for InMemoryDataFlowController {
    async fn start(&self, process: &TransferProcess) -> Result<(), DataFlowError> {
        if let Some(error) = lock(&self.start_failures).pop_front() {
            return Err(error);
        }
        lock(&self.started).push(process.core.id.clone());
        Ok(())
    }

    async fn stop(&self, process: &TransferProcess) -> Result<(), DataFlowError> {
        if let Some(error) = lock(&self.stop_failures).pop_front() {
            return Err(error);
        }
        lock(&self.stopped).push(process.core.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{DataAddress, TransferRequest};

    fn process() -> TransferProcess {
        TransferProcess::from_request(
            TransferRequest {
                asset_id: "asset-1".to_string(),
                counter_party_address: "https://provider.example/dsp".to_string(),
                data_destination: DataAddress::new("HttpData"),
            },
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_asset_index_lookup() {
        let index = InMemoryAssetIndex::new(["asset-1"]);
        assert!(index.contains("asset-1").await.unwrap());
        assert!(!index.contains("asset-2").await.unwrap());

        index.insert("asset-2");
        assert!(index.contains("asset-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_queued_start_failures_are_consumed_in_order() {
        let controller = InMemoryDataFlowController::new();
        controller.fail_next_start(DataFlowError::Transient("busy".into()));
        controller.fail_next_start(DataFlowError::Permanent("rejected".into()));
        let process = process();

        assert_eq!(
            controller.start(&process).await,
            Err(DataFlowError::Transient("busy".into()))
        );
        assert_eq!(
            controller.start(&process).await,
            Err(DataFlowError::Permanent("rejected".into()))
        );
        assert_eq!(controller.start(&process).await, Ok(()));
        assert_eq!(controller.started(), vec![process.core.id.clone()]);

        controller.fail_next_stop(DataFlowError::Transient("unreachable".into()));
        assert!(controller.stop(&process).await.is_err());
        assert!(controller.stopped().is_empty());
        controller.stop(&process).await.unwrap();
        assert_eq!(controller.stopped(), vec![process.core.id.clone()]);
    }
}
