// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine façade.
//!
//! The [`PatientIdEngine`] ties the components together:
//! - SQL table of sequence periods (ground truth) and the patient directory
//! - optional Redis cache for the fast path
//! - the [`PatientCodeAllocator`] and the [`DuplicateDetector`]
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use patient_id_engine::{PatientIdEngine, PatientIdConfig, EngineState};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = PatientIdConfig {
//!     sql_url: Some("sqlite:patients.db?mode=rwc".into()),
//!     ..Default::default()
//! };
//! let mut engine = PatientIdEngine::new(config);
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.expect("Start failed");
//! let code = engine.generate_code("CENTREA").await.unwrap();
//! println!("{}", code);
//!
//! engine.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{EngineState, HealthCheck};

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::allocator::PatientCodeAllocator;
use crate::config::PatientIdConfig;
use crate::duplicates::DuplicateDetector;
use crate::resilience::circuit_breaker::BackendCircuits;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{PatientDirectory, SequenceCache, SequenceStore};

/// Storage handles the engine runs on.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn SequenceStore>,
    pub directory: Arc<dyn PatientDirectory>,
    pub cache: Option<Arc<dyn SequenceCache>>,
}

impl Backends {
    /// One SQL store serving both the sequence table and the patient table.
    pub fn sql(store: Arc<SqlStore>, cache: Option<Arc<dyn SequenceCache>>) -> Self {
        Self {
            store: store.clone(),
            directory: store,
            cache,
        }
    }
}

/// Main entry point for patient code allocation and duplicate checks.
///
/// `Send + Sync`: share it behind an `Arc` once started.
pub struct PatientIdEngine {
    pub(super) config: PatientIdConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) circuits: BackendCircuits,
    pub(super) backends: Option<Backends>,
    pub(super) allocator: Option<PatientCodeAllocator>,
    pub(super) detector: Option<DuplicateDetector>,
}

impl PatientIdEngine {
    /// Create an engine in the `Created` state. Call
    /// [`start()`](Self::start) to connect and become `Ready`.
    pub fn new(config: PatientIdConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        crate::metrics::set_engine_state("Created");

        Self {
            config,
            state: state_tx,
            state_rx,
            circuits: BackendCircuits::new(),
            backends: None,
            allocator: None,
            detector: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PatientIdConfig {
        &self.config
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    /// Ping the backends and collect internal state.
    ///
    /// Cache PING and SQL `SELECT 1` run in parallel.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = state == EngineState::Ready;

        let (cache_result, sql_result) = tokio::join!(self.ping_cache(), self.ping_sql());
        let (cache_connected, cache_latency_ms) = cache_result;
        let (sql_connected, sql_latency_ms) = sql_result;

        if let Some(connected) = cache_connected {
            crate::metrics::set_backend_healthy("cache", connected);
        }
        if let Some(connected) = sql_connected {
            crate::metrics::set_backend_healthy("database", connected);
        }

        HealthCheck {
            state,
            ready,
            fast_path_enabled: self.allocator.as_ref().is_some_and(|a| a.fast_path_enabled()),
            cache_connected,
            cache_latency_ms,
            sql_connected,
            sql_latency_ms,
            cache_circuit_rejections: self.circuits.cache.rejections(),
            background_in_flight: self.allocator.as_ref().map_or(0, |a| a.background_in_flight()),
            healthy: ready && sql_connected == Some(true),
        }
    }

    async fn ping_cache(&self) -> (Option<bool>, Option<u64>) {
        let Some(cache) = self.backends.as_ref().and_then(|b| b.cache.clone()) else {
            return (None, None);
        };
        let start = Instant::now();
        match cache.ping().await {
            Ok(()) => (Some(true), Some(start.elapsed().as_millis() as u64)),
            Err(_) => (Some(false), None),
        }
    }

    async fn ping_sql(&self) -> (Option<bool>, Option<u64>) {
        let Some(ref backends) = self.backends else {
            return (None, None);
        };
        let start = Instant::now();
        match backends.store.ping().await {
            Ok(()) => (Some(true), Some(start.elapsed().as_millis() as u64)),
            Err(_) => (Some(false), None),
        }
    }
}
