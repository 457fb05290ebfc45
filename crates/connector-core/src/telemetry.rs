// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trace-context capture and propagation for entity processing.
//!
//! Entities carry a W3C `traceparent` in their `trace_context` map. When a
//! processor picks an entity up, its processing future runs inside a span
//! carrying that trace id and inside a task-local copy of the context, so a
//! [`Telemetry::capture`] call made anywhere during processing (for example
//! when creating a follow-up entity) continues the same trace.
//!
//! # Usage
//!
//! ```rust,ignore
//! connector_core::telemetry::init_subscriber()?;
//! let telemetry = Telemetry::new();
//! telemetry.instrument(&entity, async move { /* ... */ }).await;
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: log filter for [`init_subscriber`] (default: info)

use std::collections::HashMap;
use std::future::Future;

use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::entity::StatefulEntity;

/// Key of the W3C trace-context header inside `trace_context`.
pub const TRACEPARENT: &str = "traceparent";

tokio::task_local! {
    static TRACE_CONTEXT: HashMap<String, String>;
}

/// Captures and propagates trace context across the async processing boundary.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    _private: (),
}

impl Telemetry {
    /// Same as [`Telemetry::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current trace context.
    ///
    /// Inside [`instrument`](Self::instrument) this is a child of the processed
    /// entity's context (same trace id, new span id); elsewhere a new trace is started.
    pub fn capture(&self) -> HashMap<String, String> {
        let parent = TRACE_CONTEXT
            .try_with(|ctx| ctx.get(TRACEPARENT).cloned())
            .ok()
            .flatten();

        let traceparent = parent
            .as_deref()
            .and_then(child_traceparent)
            .unwrap_or_else(new_traceparent);

        HashMap::from([(TRACEPARENT.to_string(), traceparent)])
    }

    /// Span for processing one entity, tagged with its trace id.
    pub fn span_for<E: StatefulEntity>(&self, entity: &E) -> Span {
        let trace_id = entity
            .core()
            .trace_context
            .get(TRACEPARENT)
            .and_then(|tp| trace_id_of(tp))
            .unwrap_or("");

        tracing::info_span!(
            "process_entity",
            kind = E::KIND,
            entity_id = %entity.id(),
            state = entity.state(),
            state_count = entity.state_count(),
            trace_id = %trace_id,
        )
    }

    /// Run `fut` inside the entity's span and trace context.
    pub fn instrument<E, F>(&self, entity: &E, fut: F) -> impl Future<Output = F::Output>
    where
        E: StatefulEntity,
        F: Future,
    {
        let span = self.span_for(entity);
        TRACE_CONTEXT.scope(entity.core().trace_context.clone(), fut.instrument(span))
    }
}

/// New root `traceparent` (`00-<trace id>-<span id>-01`).
pub fn new_traceparent() -> String {
    format!("00-{}-{}-01", Uuid::new_v4().simple(), span_id())
}

/// Child of `parent`: same trace id and flags, new span id. `None` if `parent` is malformed.
pub fn child_traceparent(parent: &str) -> Option<String> {
    let trace_id = trace_id_of(parent)?;
    let flags = parent.rsplit('-').next().filter(|f| f.len() == 2)?;
    Some(format!("00-{}-{}-{}", trace_id, span_id(), flags))
}

fn trace_id_of(traceparent: &str) -> Option<&str> {
    let mut parts = traceparent.split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;
    let valid = version.len() == 2
        && trace_id.len() == 32
        && parent_id.len() == 16
        && flags.len() == 2
        && parts.next().is_none()
        && trace_id.chars().all(|c| c.is_ascii_hexdigit());
    valid.then_some(trace_id)
}

fn span_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

/// Initialize the global tracing subscriber.
///
/// - fmt layer writing to stderr
/// - `EnvFilter` from `RUST_LOG` (default: info)
pub fn init_subscriber() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    use tracing_subscriber::layer::SubscriberExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);

    let subscriber = tracing_subscriber::Registry::default()
        .with(fmt)
        .with(filter);

    tracing::subscriber::set_global_default(subscriber)
}
