// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector Transfer - Transfer Process Manager
//!
//! Moves transfer processes from request to completion on top of
//! `connector_core`. Any number of connector instances can share one database:
//! each process is advanced by exactly one of them at a time.
//!
//! ```text
//!   initiate() ──► INITIAL ──► STARTING ──► STARTED ──complete()──► COMPLETING ──► COMPLETED
//!                     │            │           │
//!                     │            │           └─terminate()──► TERMINATING ──► TERMINATED
//!                     └────────────┴── unknown asset / data flow failure ──────────▲
//! ```
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CONNECTOR_DATABASE_URL` | required | PostgreSQL or `sqlite:` URL |
//! | `CONNECTOR_RUNTIME_ID` | random UUID | Lease holder identity |
//! | `CONNECTOR_DB_MAX_CONNECTIONS` | `10` | PostgreSQL pool size |
//! | `CONNECTOR_ASSET_IDS` | empty | Comma-separated known assets |
//! | `CONNECTOR_TRANSFER_*` | | Engine settings, see `connector_core::config` |

/// External collaborator traits and in-memory implementations.
pub mod collaborators;

/// Daemon configuration.
pub mod config;

/// Transfer process manager.
pub mod manager;

/// Transfer process entity.
pub mod process;

pub use collaborators::{
    AssetIndex, DataFlowController, DataFlowError, InMemoryAssetIndex, InMemoryDataFlowController,
};
pub use config::Config;
pub use manager::{TransferError, TransferProcessManager};
pub use process::{DataAddress, TransferProcess, TransferProcessState, TransferRequest};
