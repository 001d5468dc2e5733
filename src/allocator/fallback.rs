// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable allocation path.
//!
//! ```text
//! local mutex(period)
//!   └─ floor = max(cached state, latest state issued here)
//!   └─ store.allocate(period, floor)      serializable transaction
//!   └─ cache CAS(observed → result)
//!        ├─ won           → done
//!        ├─ cache behind  → CAS again from the new value
//!        ├─ cache ahead   → discard result (gap), retry with new floor
//!        └─ unreachable   → done, period marked unpublished
//! ```
//!
//! The cache CAS is what keeps the fast path and this path from issuing the
//! same code: a result only counts once the cache has moved to it, unless
//! the cache cannot be reached at all. In that case the floor is the newest
//! state this process issued through the cache, since the table may still
//! be waiting on its write-behinds.

use std::sync::Arc;
use tracing::{debug, warn};

use super::mutex_registry::MutexRegistry;
use super::sync_bridge::SyncBridge;
use super::types::AllocationError;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::sequence::{PeriodKey, SequenceState};
use crate::storage::traits::{SequenceStore, StorageError};

pub struct DurableFallback {
    store: Arc<dyn SequenceStore>,
    bridge: Option<Arc<SyncBridge>>,
    registry: MutexRegistry,
    circuit: Arc<CircuitBreaker>,
    reconcile_attempts: usize,
}

/// Outcome of publishing a durable result into the cache.
enum Publish {
    Done,
    /// The cache is at or past the result; holds the raw cached value
    Superseded(String),
}

impl DurableFallback {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        bridge: Option<Arc<SyncBridge>>,
        circuit: Arc<CircuitBreaker>,
        reconcile_attempts: usize,
    ) -> Self {
        Self {
            store,
            bridge,
            registry: MutexRegistry::new(),
            circuit,
            reconcile_attempts: reconcile_attempts.max(1),
        }
    }

    pub fn registry(&self) -> &MutexRegistry {
        &self.registry
    }

    /// Allocate the next state of `period` through the table.
    #[tracing::instrument(skip(self), fields(tenant = period.tenant(), year = period.year()))]
    pub async fn allocate(&self, period: &PeriodKey) -> Result<SequenceState, AllocationError> {
        let _guard = self.registry.lock(period).await;

        let Some(ref bridge) = self.bridge else {
            return self.allocate_in_store(period, None).await;
        };

        let mut observed = match bridge.read(period).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Cache unreachable, allocating from table alone");
                let state = self.allocate_in_store(period, bridge.latest(period)).await?;
                bridge.mark_unpublished(period);
                return Ok(state);
            }
        };

        for attempt in 1..=self.reconcile_attempts {
            let cached = observed.as_deref().and_then(|raw| match SequenceState::decode(raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "Ignoring corrupt cached state");
                    None
                }
            });
            let floor = match (cached, bridge.latest(period)) {
                (Some(a), Some(b)) => Some(SequenceState::max_of(a, b)),
                (a, b) => a.or(b),
            };

            let result = self.allocate_in_store(period, floor).await?;

            match self.publish(bridge, period, observed.clone(), &result).await {
                Ok(Publish::Done) => return Ok(result),
                Ok(Publish::Superseded(current)) => {
                    debug!(
                        attempt,
                        discarded = result.last_number,
                        suffix = %result.last_suffix,
                        "Cache moved past durable result, discarding it"
                    );
                    crate::metrics::record_reconcile_discard();
                    observed = Some(current);
                }
                Err(e) => {
                    warn!(error = %e, "Cache unreachable after durable allocation");
                    bridge.mark_unpublished(period);
                    return Ok(result);
                }
            }
        }

        Err(AllocationError::LockTimeout(format!(
            "{} kept advancing in the cache for {} durable attempts",
            period, self.reconcile_attempts
        )))
    }

    async fn allocate_in_store(
        &self,
        period: &PeriodKey,
        floor: Option<SequenceState>,
    ) -> Result<SequenceState, AllocationError> {
        // Capacity is an answer, not a backend failure: keep it out of the circuit
        let outcome = self
            .circuit
            .call(|| async {
                match self.store.allocate(period, floor).await {
                    Ok(state) => Ok(Ok(state)),
                    Err(StorageError::CapacityExhausted(p)) => Ok(Err(p)),
                    Err(e) => Err(e),
                }
            })
            .await;

        match outcome {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(period)) => Err(AllocationError::CapacityExceeded { period }),
            Err(CircuitError::Rejected) => Err(AllocationError::BackendUnavailable(
                "database circuit open".to_string(),
            )),
            Err(CircuitError::Inner(e)) => Err(e.into()),
        }
    }

    /// Move the cache from `observed` to `result`, following the cache
    /// forward while it is still behind `result`.
    async fn publish(
        &self,
        bridge: &SyncBridge,
        period: &PeriodKey,
        mut observed: Option<String>,
        result: &SequenceState,
    ) -> Result<Publish, StorageError> {
        for _ in 0..self.reconcile_attempts {
            if bridge.compare_and_set(period, observed.as_deref(), result).await? {
                return Ok(Publish::Done);
            }
            let current = bridge.read(period).await?;
            match current {
                Some(raw) => match SequenceState::decode(&raw) {
                    Ok(state) if state.ordinal() >= result.ordinal() => {
                        return Ok(Publish::Superseded(raw));
                    }
                    _ => observed = Some(raw),
                },
                None => observed = None,
            }
        }
        // Still behind after every attempt; leave it unpublished rather than spin
        Err(StorageError::Conflict(format!("cache for {} kept changing", period)))
    }
}
