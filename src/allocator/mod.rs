// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Patient code allocation.
//!
//! [`PatientCodeAllocator`] issues codes of the form
//! `{TENANT}-{YEAR}-{NNN}-{LLL}`, unique per tenant and year across every
//! process sharing the same cache and table:
//!
//! ```text
//!                  ┌─────────────── generate_code(tenant) ───────────────┐
//!                  │                                                     │
//!   fast path ─────┤ Redis lock → GET → CAS(advance) → unlock            │
//!   (timeout)      │         └─ write-behind ─→ patient_sequences        │
//!                  │                                                     │
//!   fallback  ─────┤ local mutex → SERIALIZABLE txn → CAS into Redis     │
//!   (timeout)      └─────────────────────────────────────────────────────┘
//! ```
//!
//! Any fast-path failure (lock contention, cache down, corrupt value) falls
//! back to the table. `CapacityExceeded` is always surfaced.

mod fallback;
mod fast_path;
mod mutex_registry;
mod sync_bridge;
mod types;

pub use fallback::DurableFallback;
pub use fast_path::{FastPath, FastPathError};
pub use mutex_registry::MutexRegistry;
pub use sync_bridge::{year_end_ttl, BackgroundPool, SyncBridge, MIN_CACHE_TTL};
pub use types::{Allocation, AllocationError, AllocationPath, SequenceUsage};

use std::sync::Arc;
use std::time::Duration;
use chrono::{Datelike, Utc};
use tracing::{error, info, warn};

use crate::config::PatientIdConfig;
use crate::metrics::LatencyTimer;
use crate::resilience::circuit_breaker::BackendCircuits;
use crate::sequence::{AllocatedCode, PeriodKey, SequenceState};
use crate::storage::traits::{SequenceCache, SequenceStore};

/// Years that render as four digits.
const YEAR_RANGE: std::ops::RangeInclusive<i32> = 1000..=9999;

pub struct PatientCodeAllocator {
    store: Arc<dyn SequenceStore>,
    bridge: Option<Arc<SyncBridge>>,
    fast_path: Option<FastPath>,
    fallback: DurableFallback,
    fast_path_timeout: Duration,
    durable_timeout: Duration,
}

impl PatientCodeAllocator {
    /// Build an allocator over a durable store and an optional cache.
    ///
    /// Without a cache every allocation is durable. With a cache but
    /// `fast_path_enabled = false`, durable results are still published to
    /// the cache so processes running the fast path stay consistent.
    pub fn new(
        config: &PatientIdConfig,
        store: Arc<dyn SequenceStore>,
        cache: Option<Arc<dyn SequenceCache>>,
        circuits: &BackendCircuits,
    ) -> Self {
        let bridge = cache.map(|cache| {
            Arc::new(SyncBridge::new(
                cache,
                store.clone(),
                config.namespace.clone(),
                config.fast_path_timeout(),
                BackgroundPool::new(config.background_workers, config.background_task_timeout()),
            ))
        });

        let fast_path = bridge
            .as_ref()
            .filter(|_| config.fast_path_enabled)
            .map(|bridge| {
                FastPath::new(
                    bridge.clone(),
                    circuits.cache.clone(),
                    config.lock_ttl(),
                    config.lock_wait(),
                    config.cas_attempts,
                )
            });

        let fallback = DurableFallback::new(
            store.clone(),
            bridge.clone(),
            circuits.database.clone(),
            config.reconcile_attempts,
        );

        Self {
            store,
            bridge,
            fast_path,
            fallback,
            fast_path_timeout: config.fast_path_timeout(),
            durable_timeout: config.durable_timeout(),
        }
    }

    #[must_use]
    pub fn fast_path_enabled(&self) -> bool {
        self.fast_path.is_some()
    }

    fn period(tenant: &str, year: i32) -> Result<PeriodKey, AllocationError> {
        if !YEAR_RANGE.contains(&year) {
            let reason = format!("year {} is not a four-digit year", year);
            return Err(AllocationError::Validation(reason));
        }
        Ok(PeriodKey::new(tenant, year)?)
    }

    /// Next code for `tenant` in the current UTC year.
    pub async fn generate_code(&self, tenant: &str) -> Result<AllocatedCode, AllocationError> {
        self.generate_code_for_year(tenant, Utc::now().year()).await
    }

    /// Next code for `tenant` in `year`.
    pub async fn generate_code_for_year(
        &self,
        tenant: &str,
        year: i32,
    ) -> Result<AllocatedCode, AllocationError> {
        self.allocate(tenant, year).await.map(|a| a.code)
    }

    /// Next code with the state behind it and the path that served it.
    #[tracing::instrument(skip(self), fields(path))]
    pub async fn allocate(&self, tenant: &str, year: i32) -> Result<Allocation, AllocationError> {
        let _timer = LatencyTimer::new("generate_code");
        let period = Self::period(tenant, year).inspect_err(|e| {
            crate::metrics::record_rejected_request(e.kind());
        })?;

        match self.allocate_period(&period).await {
            Ok((state, path)) => {
                tracing::Span::current().record("path", path.as_str());
                crate::metrics::record_allocation(path.as_str(), "success");
                Ok(Allocation {
                    code: state.code(&period),
                    state,
                    path,
                })
            }
            Err((e, path)) => {
                tracing::Span::current().record("path", path.as_str());
                crate::metrics::record_allocation(path.as_str(), e.kind());
                match e {
                    AllocationError::CapacityExceeded { .. } => {
                        crate::metrics::record_capacity_exhausted(period.tenant());
                        warn!(period = %period, "Patient code capacity exhausted");
                    }
                    ref other => error!(period = %period, error = %other, "Allocation failed"),
                }
                Err(e)
            }
        }
    }

    /// Errors carry the path that failed.
    async fn allocate_period(
        &self,
        period: &PeriodKey,
    ) -> Result<(SequenceState, AllocationPath), (AllocationError, AllocationPath)> {
        if let Some(ref fast) = self.fast_path {
            let attempt = fast.allocate(period, &self.fallback);
            match tokio::time::timeout(self.fast_path_timeout, attempt).await {
                Ok(Ok(done)) => return Ok(done),
                Ok(Err(FastPathError::Surfaced(e, path))) => return Err((e, path)),
                Ok(Err(e)) => {
                    warn!(
                        period = %period,
                        reason = e.reason(),
                        error = %e,
                        "Fast path failed, falling back"
                    );
                    crate::metrics::record_fallback(e.reason());
                }
                Err(_) => {
                    warn!(
                        period = %period,
                        timeout_ms = self.fast_path_timeout.as_millis() as u64,
                        "Fast path timed out, falling back"
                    );
                    crate::metrics::record_fallback("timeout");
                }
            }
        }

        match tokio::time::timeout(self.durable_timeout, self.fallback.allocate(period)).await {
            Ok(Ok(state)) => Ok((state, AllocationPath::Durable)),
            Ok(Err(e)) => Err((e, AllocationPath::Durable)),
            Err(_) => Err((
                AllocationError::BackendUnavailable(format!(
                    "durable allocation for {} timed out after {:?}",
                    period, self.durable_timeout
                )),
                AllocationPath::Durable,
            )),
        }
    }

    /// Seed the cache for a period from the table. Returns the usage seen
    /// in the table, `None` if nothing was allocated yet.
    pub async fn warm_up(&self, tenant: &str, year: i32) -> Result<Option<SequenceUsage>, AllocationError> {
        let period = Self::period(tenant, year)?;
        let state = match self.bridge {
            Some(ref bridge) => bridge.warm_up(&period).await?,
            None => self.store.load(&period).await?,
        };
        Ok(state.map(|s| SequenceUsage::from_state(&period, &s)))
    }

    /// Consumption of a period: the later of the table and the cache.
    pub async fn sequence_usage(&self, tenant: &str, year: i32) -> Result<SequenceUsage, AllocationError> {
        let period = Self::period(tenant, year)?;
        let durable = self.store.load(&period).await?.unwrap_or_default();

        let cached = match self.bridge {
            Some(ref bridge) => match bridge.read(&period).await {
                Ok(raw) => raw.and_then(|raw| SequenceState::decode(&raw).ok()),
                Err(e) => {
                    warn!(period = %period, error = %e, "Cache unreachable, reporting table usage only");
                    None
                }
            },
            None => None,
        };

        let state = cached.map_or(durable, |c| SequenceState::max_of(durable, c));
        Ok(SequenceUsage::from_state(&period, &state))
    }

    /// Usage of every period of a tenant recorded in the table, newest first.
    pub async fn tenant_usage(&self, tenant: &str) -> Result<Vec<SequenceUsage>, AllocationError> {
        let tenant = crate::sequence::normalize_tenant(tenant)?;
        let mut usage = Vec::new();
        for (year, state) in self.store.list_periods(&tenant).await? {
            let period = PeriodKey::new(&tenant, year)?;
            usage.push(SequenceUsage::from_state(&period, &state));
        }
        Ok(usage)
    }

    #[must_use]
    pub fn background_in_flight(&self) -> usize {
        self.bridge.as_ref().map_or(0, |b| b.pool().in_flight())
    }

    /// Wait for pending write-behinds.
    pub async fn wait_idle(&self) {
        if let Some(ref bridge) = self.bridge {
            bridge.wait_idle().await;
            info!("Background sync drained");
        }
    }
}
