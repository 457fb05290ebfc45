// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The transfer process entity and its states.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use connector_core::{EntityCore, StatefulEntity};

/// Transfer process lifecycle.
///
/// ```text
///   INITIAL ──► STARTING ──► STARTED ──► COMPLETING ──► COMPLETED
///      │           │   ▲        │
///      │           └───┘ retry  │
///      │           │            ▼
///      │           │       TERMINATING ──► TERMINATED
///      └───────────┴──────────────────────────▲
///                 permanent failure / retries exhausted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TransferProcessState {
    /// Requested, asset not yet checked.
    Initial = 100,
    /// Data flow being started.
    Starting = 550,
    /// Data is flowing.
    Started = 600,
    /// Completion requested, data flow being stopped.
    Completing = 750,
    /// Finished successfully.
    Completed = 800,
    /// Termination requested, data flow being stopped.
    Terminating = 825,
    /// Finished unsuccessfully; `error_detail` says why.
    Terminated = 850,
}

impl TransferProcessState {
    /// Numeric state code stored on the entity.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            100 => Some(Self::Initial),
            550 => Some(Self::Starting),
            600 => Some(Self::Started),
            750 => Some(Self::Completing),
            800 => Some(Self::Completed),
            825 => Some(Self::Terminating),
            850 => Some(Self::Terminated),
            _ => None,
        }
    }

    /// No further transition happens from a final state.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Completing => "COMPLETING",
            Self::Completed => "COMPLETED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl std::fmt::Display for TransferProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where transferred data goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    /// Destination type, e.g. `HttpData`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DataAddress {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Request to transfer one asset to a counter-party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub asset_id: String,
    pub counter_party_address: String,
    pub data_destination: DataAddress,
}

/// A transfer of one asset to one counter-party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProcess {
    pub core: EntityCore,
    pub asset_id: String,
    pub counter_party_address: String,
    pub data_destination: DataAddress,
    /// Why termination was requested; survives failed attempts to stop the data flow.
    #[serde(default)]
    pub termination_reason: Option<String>,
}

impl TransferProcess {
    /// New process in `INITIAL` with a random id.
    pub fn from_request(request: TransferRequest, now: DateTime<Utc>) -> Self {
        Self {
            core: EntityCore::new(TransferProcessState::Initial.code(), now),
            asset_id: request.asset_id,
            counter_party_address: request.counter_party_address,
            data_destination: request.data_destination,
            termination_reason: None,
        }
    }

    /// Typed state; `None` only for rows written by an incompatible version.
    pub fn process_state(&self) -> Option<TransferProcessState> {
        TransferProcessState::from_code(self.state())
    }

    pub fn transition(&mut self, state: TransferProcessState, now: DateTime<Utc>) {
        self.transition_to(state.code(), now);
    }
}

impl StatefulEntity for TransferProcess {
    const KIND: &'static str = "transfer_process";

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }
}
