// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the engine façade.

/// Engine lifecycle state.
///
/// ```text
/// Created → Connecting → Ready → ShuttingDown → Stopped
/// ```
///
/// Use [`super::PatientIdEngine::state()`] to check the current state or
/// [`super::PatientIdEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to the table and the cache
    Connecting,
    /// Serving requests
    Ready,
    /// Draining background work
    ShuttingDown,
    /// Shut down; requests are refused
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot for `/ready` and `/health` endpoints.
///
/// `None` for a backend means it is not configured.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub state: EngineState,
    pub ready: bool,
    pub fast_path_enabled: bool,
    pub cache_connected: Option<bool>,
    pub cache_latency_ms: Option<u64>,
    pub sql_connected: Option<bool>,
    pub sql_latency_ms: Option<u64>,
    /// Calls the cache circuit refused while open
    pub cache_circuit_rejections: u64,
    /// Write-behinds currently running
    pub background_in_flight: usize,
    /// Ready and the table answers. A missing cache only degrades latency.
    pub healthy: bool,
}
