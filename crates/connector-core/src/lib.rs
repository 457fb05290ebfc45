// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector Core - Lease-Guarded State Machine Engine
//!
//! This crate provides the engine every long-running connector process
//! (contract negotiation, transfer process, policy monitoring) runs on. Entities
//! are advanced through their states exactly-once-at-a-time, by any number of
//! connector instances sharing one database, with retry, back-off and crash
//! recovery.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Business Managers (per entity kind)                   │
//! │          transfer processes, negotiations, policy monitoring             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ holds
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         StateEntityManager<E>                            │
//! │        Clock, Telemetry, batch size, update() / break_lease()            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ start() / stop()
//!                                    ▼
//! ┌───────────────────────┐        invokes       ┌─────────────────────────┐
//! │  StateMachineManager  │─────────────────────►│  Processor (per state)  │
//! │  loop + WaitStrategy  │   Σ entities moved    │ fetch → process → lease │
//! └───────────────────────┘◄─────────────────────└─────────────────────────┘
//!                                                            │
//!                                                            ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              StateEntityStore<E> + LeaseContext                          │
//! │     next_not_leased (select-and-lock), save, find_by_id, leases          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌───────────────────────┐ ┌───────────────────────┐ ┌───────────────────┐
//! │      PostgreSQL       │ │        SQLite         │ │     In-memory     │
//! └───────────────────────┘ └───────────────────────┘ └───────────────────┘
//! ```
//!
//! # Lease Semantics
//!
//! | Situation | `acquire_lease` | `break_lease` |
//! |-----------|-----------------|---------------|
//! | No lease | granted | no-op |
//! | Own lease | renewed | removed |
//! | Foreign lease, live | `LeaseConflict` | `LeaseConflict` |
//! | Foreign lease, expired | taken over | no-op |
//!
//! An entity with a live foreign lease is never returned by `next_not_leased`.
//! A holder that crashes without breaking its leases loses them after
//! `lease_duration`, and any other holder picks the entities up.
//!
//! # Configuration
//!
//! Per manager, with an environment variable prefix (see [`config`]):
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `{PREFIX}_BATCH_SIZE` | `20` | Entities leased per processor call |
//! | `{PREFIX}_ITERATION_WAIT_MS` | `1000` | First idle back-off |
//! | `{PREFIX}_ITERATION_WAIT_MAX_MS` | `30000` | Idle back-off cap |
//! | `{PREFIX}_LEASE_DURATION_MS` | `60000` | Lease validity |
//! | `{PREFIX}_RETRY_LIMIT` | `7` | Retries per state |
//! | `{PREFIX}_RETRY_BASE_DELAY_MS` | `1000` | First entity retry delay |
//! | `{PREFIX}_RETRY_MAX_DELAY_MS` | `60000` | Entity retry delay cap |
//!
//! # Modules
//!
//! - [`entity`]: `EntityCore` and the `StatefulEntity` trait
//! - [`lease`]: leases, the `LeaseContext` trait and its retry wrapper
//! - [`store`]: the store contract and selection criteria
//! - [`persistence`]: memory, SQLite and PostgreSQL backends
//! - [`processor`], [`state_machine`], [`manager`]: the processing loop
//! - [`wait`], [`retry`]: idle back-off and entity retry policies

#![deny(missing_docs)]

/// Time source abstraction.
pub mod clock;

/// Entity manager configuration loaded from environment variables.
pub mod config;

/// Persisted stateful entities.
pub mod entity;

/// Error types with error code mapping.
pub mod error;

/// Leases and lease contexts.
pub mod lease;

/// Business manager base (composition).
pub mod manager;

/// Embedded database migrations.
pub mod migrations;

/// Store and lease backends.
pub mod persistence;

/// Batch processors.
pub mod processor;

/// Entity retry and failure policies.
pub mod retry;

/// The processing loop.
pub mod state_machine;

/// Store contract.
pub mod store;

/// Trace-context propagation and subscriber setup.
pub mod telemetry;

/// Idle back-off strategies.
pub mod wait;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EntityManagerConfig};
pub use entity::{EntityCore, StatefulEntity};
pub use error::{EngineError, Result};
pub use lease::{Lease, LeaseContext, LeaseRetryPolicy, RetryingLeaseContext};
pub use manager::StateEntityManager;
pub use processor::{Processor, StateProcessor};
pub use retry::{EntityRetryPolicy, FailureOutcome, FailurePolicy};
pub use state_machine::{StateMachineConfig, StateMachineManager};
pub use store::{Criterion, StateEntityStore};
pub use telemetry::Telemetry;
pub use wait::{ExponentialWaitStrategy, FixedWaitStrategy, WaitStrategy};
