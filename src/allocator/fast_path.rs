// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-backed allocation under a distributed lock.
//!
//! ```text
//! lock(period, token, ttl)          bounded wait, contention → fall back
//!   └─ raw = GET state
//!        ├─ absent   → durable allocation (cold start, seeds the cache)
//!        ├─ corrupt  → fall back
//!        └─ present  → CAS(raw → advance(raw)), re-read on a lost compare
//! unlock(period, token)             only if still ours
//! write-behind(state)               background, best effort
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::fallback::DurableFallback;
use super::sync_bridge::SyncBridge;
use super::types::{AllocationError, AllocationPath};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::sequence::{PeriodKey, SequenceState};
use crate::storage::traits::StorageError;

/// Why the fast path did not produce a code.
#[derive(Error, Debug)]
pub enum FastPathError {
    #[error("cache circuit open")]
    CircuitOpen,
    #[error("lock held by another allocator")]
    LockContended,
    #[error("cache unavailable: {0}")]
    Unavailable(StorageError),
    #[error("corrupt cached state '{0}'")]
    Corrupt(String),
    #[error("lost compare-and-set {0} times")]
    CasExhausted(usize),
    /// Final answer, must not be retried elsewhere; carries the path that
    /// produced it
    #[error("{0}")]
    Surfaced(AllocationError, AllocationPath),
}

impl FastPathError {
    /// Label for the fallback metric.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::LockContended => "lock_timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Corrupt(_) => "corrupt",
            Self::CasExhausted(_) => "cas_exhausted",
            Self::Surfaced(..) => "surfaced",
        }
    }
}

pub struct FastPath {
    bridge: Arc<SyncBridge>,
    circuit: Arc<CircuitBreaker>,
    lock_ttl: Duration,
    lock_wait: RetryConfig,
    cas_attempts: usize,
}

impl FastPath {
    pub fn new(
        bridge: Arc<SyncBridge>,
        circuit: Arc<CircuitBreaker>,
        lock_ttl: Duration,
        lock_wait: RetryConfig,
        cas_attempts: usize,
    ) -> Self {
        Self {
            bridge,
            circuit,
            lock_ttl,
            lock_wait,
            cas_attempts: cas_attempts.max(1),
        }
    }

    pub fn bridge(&self) -> &Arc<SyncBridge> {
        &self.bridge
    }

    /// Run a cache call through the circuit breaker.
    async fn cached<T, F, Fut>(&self, f: F) -> Result<T, FastPathError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        self.circuit.call(f).await.map_err(|e| match e {
            CircuitError::Rejected => FastPathError::CircuitOpen,
            CircuitError::Inner(e) => FastPathError::Unavailable(e),
        })
    }

    async fn acquire(&self, period: &PeriodKey, token: &str) -> Result<(), FastPathError> {
        retry_if(
            "sequence_lock",
            &self.lock_wait,
            || async {
                let locked = self
                    .cached(|| self.bridge.try_lock(period, token, self.lock_ttl))
                    .await?;
                if locked {
                    Ok(())
                } else {
                    Err(FastPathError::LockContended)
                }
            },
            |e| matches!(e, FastPathError::LockContended),
        )
        .await
    }

    async fn release(&self, period: &PeriodKey, token: &str) {
        match self.cached(|| self.bridge.unlock(period, token)).await {
            Ok(true) => {}
            Ok(false) => warn!(period = %period, "Sequence lock expired before release"),
            Err(e) => warn!(period = %period, error = %e, "Failed to release sequence lock, it will expire"),
        }
    }

    /// Allocate under the distributed lock.
    ///
    /// A cold cache is seeded through `fallback`, which is the only case
    /// where this returns [`AllocationPath::Durable`].
    pub async fn allocate(
        &self,
        period: &PeriodKey,
        fallback: &DurableFallback,
    ) -> Result<(SequenceState, AllocationPath), FastPathError> {
        let token = Uuid::new_v4().to_string();
        self.acquire(period, &token).await?;
        let result = self.allocate_locked(period, fallback).await;
        self.release(period, &token).await;
        result
    }

    async fn allocate_locked(
        &self,
        period: &PeriodKey,
        fallback: &DurableFallback,
    ) -> Result<(SequenceState, AllocationPath), FastPathError> {
        if self.bridge.is_unpublished(period) {
            self.bridge
                .reconcile(period)
                .await
                .map_err(FastPathError::Unavailable)?;
        }

        for attempt in 1..=self.cas_attempts {
            let raw = self.cached(|| self.bridge.read(period)).await?;

            let Some(raw) = raw else {
                debug!(period = %period, "Cold cache, allocating through the table");
                let state = fallback
                    .allocate(period)
                    .await
                    .map_err(|e| FastPathError::Surfaced(e, AllocationPath::Durable))?;
                return Ok((state, AllocationPath::Durable));
            };

            let current = SequenceState::decode(&raw).map_err(|_| FastPathError::Corrupt(raw.clone()))?;
            let next = current.advance().map_err(|_| {
                let exhausted = AllocationError::CapacityExceeded {
                    period: period.to_string(),
                };
                FastPathError::Surfaced(exhausted, AllocationPath::Fast)
            })?;

            let swapped = self
                .cached(|| self.bridge.compare_and_set(period, Some(raw.as_str()), &next))
                .await?;
            if swapped {
                self.bridge.schedule_write_behind(period.clone(), next);
                return Ok((next, AllocationPath::Fast));
            }
            debug!(period = %period, attempt, "Cached state changed under the lock, re-reading");
        }

        Err(FastPathError::CasExhausted(self.cas_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::allocator::sync_bridge::BackgroundPool;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::InMemoryCache;
    use crate::storage::sql::SqlStore;
    use crate::storage::traits::{SequenceCache, SequenceStore};

    struct Fixture {
        _dir: TempDir,
        cache: Arc<InMemoryCache>,
        store: Arc<SqlStore>,
        fast: FastPath,
        fallback: DurableFallback,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("fast.db").display());
        let store = Arc::new(SqlStore::new(&url).await.unwrap());
        let cache = Arc::new(InMemoryCache::new());
        let bridge = Arc::new(SyncBridge::new(
            cache.clone(),
            store.clone(),
            "hms",
            Duration::from_secs(1),
            BackgroundPool::new(8, Duration::from_secs(5)),
        ));
        let fast = FastPath::new(
            bridge.clone(),
            Arc::new(CircuitBreaker::new("cache", CircuitConfig::cache())),
            Duration::from_secs(5),
            RetryConfig::test(),
            3,
        );
        let fallback = DurableFallback::new(
            store.clone(),
            Some(bridge),
            Arc::new(CircuitBreaker::new("database", CircuitConfig::database())),
            8,
        );
        Fixture { _dir: dir, cache, store, fast, fallback }
    }

    fn period() -> PeriodKey {
        PeriodKey::new("CENTREA", 2025).unwrap()
    }

    #[tokio::test]
    async fn test_cold_start_goes_through_table() {
        let f = fixture().await;

        let (state, path) = f.fast.allocate(&period(), &f.fallback).await.unwrap();

        assert_eq!(path, AllocationPath::Durable);
        assert_eq!(state.last_number, 1);
        assert_eq!(
            f.cache.get(&period().state_key("hms")).await.unwrap().as_deref(),
            Some("1:AAA:1")
        );
    }

    #[tokio::test]
    async fn test_warm_cache_advances_in_place() {
        let f = fixture().await;
        f.fast.allocate(&period(), &f.fallback).await.unwrap();

        let (state, path) = f.fast.allocate(&period(), &f.fallback).await.unwrap();

        assert_eq!(path, AllocationPath::Fast);
        assert_eq!(state.last_number, 2);
        assert_eq!(state.generated_count, 2);

        // Write-behind catches the table up
        f.fast.bridge().wait_idle().await;
        assert_eq!(f.store.load(&period()).await.unwrap().unwrap().last_number, 2);
        // Lock released
        assert!(f.cache.get(&period().lock_key("hms")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_held_lock_is_contention() {
        let f = fixture().await;
        f.cache
            .try_lock(&period().lock_key("hms"), "someone-else", Duration::from_secs(5))
            .await
            .unwrap();

        let err = f.fast.allocate(&period(), &f.fallback).await.unwrap_err();

        assert!(matches!(err, FastPathError::LockContended));
        assert_eq!(err.reason(), "lock_timeout");
        // The other holder keeps its lock
        assert_eq!(
            f.cache.get(&period().lock_key("hms")).await.unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let f = fixture().await;
        f.cache
            .set(&period().state_key("hms"), "999:aa", Duration::from_secs(60))
            .await
            .unwrap();

        let err = f.fast.allocate(&period(), &f.fallback).await.unwrap_err();

        assert!(matches!(err, FastPathError::Corrupt(_)));
        assert!(f.cache.get(&period().lock_key("hms")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollover_in_cache() {
        let f = fixture().await;
        f.cache
            .set(&period().state_key("hms"), "999:AAA:999", Duration::from_secs(60))
            .await
            .unwrap();

        let (state, _) = f.fast.allocate(&period(), &f.fallback).await.unwrap();

        assert_eq!(state.code(&period()).to_string(), "CENTREA-2025-001-AAB");
        assert_eq!(state.generated_count, 1000);
    }

    #[tokio::test]
    async fn test_exhausted_cache_is_surfaced() {
        let f = fixture().await;
        f.cache
            .set(&period().state_key("hms"), "999:ZZZ:17558424", Duration::from_secs(60))
            .await
            .unwrap();

        let err = f.fast.allocate(&period(), &f.fallback).await.unwrap_err();

        assert!(matches!(
            err,
            FastPathError::Surfaced(AllocationError::CapacityExceeded { .. }, AllocationPath::Fast)
        ));
        assert_eq!(
            f.cache.get(&period().state_key("hms")).await.unwrap().as_deref(),
            Some("999:ZZZ:17558424")
        );
    }
}
