// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the patient identifier engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `patient_id_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `path`: fast, durable
//! - `status`: success, or the error kind (exhausted, unavailable, lock_timeout, corrupt)
//! - `reason`: why a request was refused or a fast path abandoned
//! - `backend`: cache, database

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an allocation attempt and the path that served it
pub fn record_allocation(path: &str, status: &str) {
    counter!(
        "patient_id_allocations_total",
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a request refused before any backend was touched
pub fn record_rejected_request(reason: &str) {
    counter!(
        "patient_id_rejected_requests_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a fast-path abandonment and why it happened
pub fn record_fallback(reason: &str) {
    counter!(
        "patient_id_fallbacks_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// A (tenant, year) ran out of codes
pub fn record_capacity_exhausted(tenant: &str) {
    counter!(
        "patient_id_capacity_exhausted_total",
        "tenant" => tenant.to_string()
    )
    .increment(1);
}

/// Durable allocation discarded because the cache was already past it
pub fn record_reconcile_discard() {
    counter!("patient_id_reconcile_discards_total").increment(1);
}

/// Outcome of a background write-behind: applied, stale, error, timeout
pub fn record_write_behind(outcome: &str) {
    counter!(
        "patient_id_write_behind_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Background task rejected because the pool was saturated
pub fn record_background_dropped(task: &str) {
    counter!(
        "patient_id_background_dropped_total",
        "task" => task.to_string()
    )
    .increment(1);
}

/// Set background tasks currently running
pub fn set_background_in_flight(count: usize) {
    gauge!("patient_id_background_in_flight").set(count as f64);
}

/// Record a duplicate check and its recommendation
pub fn record_duplicate_check(recommendation: &str) {
    counter!(
        "patient_id_duplicate_checks_total",
        "recommendation" => recommendation.to_string()
    )
    .increment(1);
}

/// Record candidates scored in one duplicate check
pub fn record_duplicate_candidates(count: usize) {
    histogram!("patient_id_duplicate_candidates").record(count as f64);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "patient_id_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a backend error
pub fn record_error(backend: &str, operation: &str) {
    counter!(
        "patient_id_errors_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set backend health status
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "patient_id_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record a call through a circuit breaker
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "patient_id_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set engine lifecycle state
pub fn set_engine_state(state: &str) {
    // 1 for the current state only; exporters read it as an enum
    for s in ["Created", "Connecting", "Ready", "ShuttingDown", "Stopped"] {
        gauge!(
            "patient_id_engine_state",
            "state" => s
        )
        .set(if s == state { 1.0 } else { 0.0 });
    }
}

/// Record startup duration
pub fn record_startup_total(duration: Duration) {
    histogram!("patient_id_startup_seconds").record(duration.as_secs_f64());
}

/// Timer that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
