// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache ⇄ table synchronization.
//!
//! - **Write-behind** (cache → table): after a fast-path allocation the new
//!   state is recorded in the table on the background pool. The upsert is
//!   monotonic, so a late or reordered write never moves the row backwards.
//! - **Warm-up** (table → cache): the durable row is published into the
//!   cache, but only if it is ahead of what the cache already holds.
//!
//! Both directions are best effort: failures are logged and counted, never
//! returned to the caller of `generate_code`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::{DashMap, DashSet};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::sequence::{PeriodKey, SequenceState};
use crate::storage::traits::{SequenceCache, SequenceStore, StorageError};

/// Cache entries never get less than this, even for past years.
pub const MIN_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Time left until January 1st of the following year (UTC).
#[must_use]
pub fn year_end_ttl(year: i32, now: DateTime<Utc>) -> Duration {
    NaiveDate::from_ymd_opt(year.saturating_add(1), 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|end| (end.and_utc() - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
        .max(MIN_CACHE_TTL)
}

/// Bounded pool for detached work.
///
/// A task that finds no free slot is not queued: an unbounded queue would
/// grow without limit while the database is slow. [`spawn`](Self::spawn)
/// drops it with a warning; [`try_spawn`](Self::try_spawn) hands the
/// decision back to the caller.
pub struct BackgroundPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    task_timeout: Duration,
}

impl BackgroundPool {
    #[must_use]
    pub fn new(capacity: usize, task_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            task_timeout,
        }
    }

    /// Run `task` in the background. Returns false if it was dropped.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.try_spawn(name, task) {
            return true;
        }
        warn!(task = name, capacity = self.capacity, "Background pool saturated, dropping task");
        crate::metrics::record_background_dropped(name);
        false
    }

    /// Run `task` in the background if a slot is free.
    pub fn try_spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return false;
        };

        let timeout = self.task_timeout;
        crate::metrics::set_background_in_flight(self.in_flight());
        tokio::spawn(async move {
            let _permit = permit;
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(task = name, timeout_ms = timeout.as_millis() as u64, "Background task timed out");
                crate::metrics::record_error("background", name);
            }
        });
        true
    }

    /// Tasks currently holding a slot
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait until every running task has finished.
    pub async fn wait_idle(&self) {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        // Holding every permit at once means nothing else is running
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
        crate::metrics::set_background_in_flight(0);
    }
}

/// Shared view of the cache and the table for one namespace.
pub struct SyncBridge {
    cache: Arc<dyn SequenceCache>,
    store: Arc<dyn SequenceStore>,
    namespace: String,
    cache_timeout: Duration,
    pool: BackgroundPool,
    /// Periods with durable allocations the cache never saw
    unpublished: DashSet<PeriodKey>,
    /// Newest state this process issued through the cache, per period
    latest: DashMap<PeriodKey, SequenceState>,
    /// Write-behinds that found the pool full, newest state per period
    deferred: DashMap<PeriodKey, SequenceState>,
}

impl SyncBridge {
    pub fn new(
        cache: Arc<dyn SequenceCache>,
        store: Arc<dyn SequenceStore>,
        namespace: impl Into<String>,
        cache_timeout: Duration,
        pool: BackgroundPool,
    ) -> Self {
        Self {
            cache,
            store,
            namespace: namespace.into(),
            cache_timeout,
            pool,
            unpublished: DashSet::new(),
            latest: DashMap::new(),
            deferred: DashMap::new(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cache(&self) -> &Arc<dyn SequenceCache> {
        &self.cache
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        match tokio::time::timeout(self.cache_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Backend(format!("cache {} timed out", op))),
        }
    }

    /// Raw cached state of `period`.
    pub async fn read(&self, period: &PeriodKey) -> Result<Option<String>, StorageError> {
        let key = period.state_key(&self.namespace);
        self.bounded("get", self.cache.get(&key)).await
    }

    /// Replace the cached state if it still equals `expected`.
    pub async fn compare_and_set(
        &self,
        period: &PeriodKey,
        expected: Option<&str>,
        state: &SequenceState,
    ) -> Result<bool, StorageError> {
        let key = period.state_key(&self.namespace);
        let ttl = year_end_ttl(period.year(), Utc::now());
        self.bounded("compare_and_set", self.cache.compare_and_set(&key, expected, &state.encode(), ttl))
            .await
    }

    pub async fn try_lock(&self, period: &PeriodKey, token: &str, ttl: Duration) -> Result<bool, StorageError> {
        let key = period.lock_key(&self.namespace);
        self.bounded("lock", self.cache.try_lock(&key, token, ttl)).await
    }

    pub async fn unlock(&self, period: &PeriodKey, token: &str) -> Result<bool, StorageError> {
        let key = period.lock_key(&self.namespace);
        self.bounded("unlock", self.cache.unlock(&key, token)).await
    }

    /// Move the cached state forward to `state`. Leaves the cache alone
    /// when it is already at or past `state`; a corrupt value is replaced.
    ///
    /// Returns whether the cache was written.
    pub async fn publish_forward(&self, period: &PeriodKey, state: &SequenceState) -> Result<bool, StorageError> {
        for _ in 0..8 {
            let raw = self.read(period).await?;
            if let Some(ref raw) = raw {
                if let Ok(current) = SequenceState::decode(raw) {
                    if current.ordinal() >= state.ordinal() {
                        return Ok(false);
                    }
                }
            }
            if self.compare_and_set(period, raw.as_deref(), state).await? {
                return Ok(true);
            }
        }
        debug!(period = %period, "Cache kept moving during publish, leaving it to the current writer");
        Ok(false)
    }

    /// Seed the cache from the durable row ahead of traffic.
    ///
    /// Returns the durable state, `None` if the period has no row yet.
    #[tracing::instrument(skip(self), fields(period = %period))]
    pub async fn warm_up(&self, period: &PeriodKey) -> Result<Option<SequenceState>, StorageError> {
        let Some(state) = self.store.load(period).await? else {
            debug!("No durable row to warm from");
            return Ok(None);
        };
        let published = self.publish_forward(period, &state).await?;
        info!(
            number = state.last_number,
            suffix = %state.last_suffix,
            published,
            "Cache warmed from durable row"
        );
        Ok(Some(state))
    }

    /// Record `state` in the table on the background pool.
    ///
    /// When the pool is full the state is held back, merged with any newer
    /// state for the same period, and written by a later call or by
    /// [`wait_idle`](Self::wait_idle). Returns false if it was held back.
    pub fn schedule_write_behind(&self, period: PeriodKey, state: SequenceState) -> bool {
        merge_forward(&self.latest, &period, state);
        let spawned = self.spawn_write_behind(period, state);
        self.flush_deferred();
        spawned
    }

    /// Newest state issued through the cache for `period` by this process.
    ///
    /// The table can lag it while write-behinds are pending, so the durable
    /// path never allocates below it.
    #[must_use]
    pub fn latest(&self, period: &PeriodKey) -> Option<SequenceState> {
        self.latest.get(period).map(|entry| *entry)
    }

    /// Write-behinds waiting for a pool slot
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn spawn_write_behind(&self, period: PeriodKey, state: SequenceState) -> bool {
        let store = self.store.clone();
        let task_period = period.clone();
        let spawned = self.pool.try_spawn("write_behind", async move {
            let period = task_period;
            match store.record(&period, &state).await {
                Ok(true) => crate::metrics::record_write_behind("applied"),
                Ok(false) => {
                    debug!(period = %period, number = state.last_number, "Write-behind superseded");
                    crate::metrics::record_write_behind("stale");
                }
                Err(e) => {
                    warn!(period = %period, error = %e, "Write-behind failed");
                    crate::metrics::record_write_behind("error");
                }
            }
        });

        if spawned {
            self.deferred.remove_if(&period, |_, held| held.ordinal() <= state.ordinal());
        } else {
            debug!(
                period = %period,
                number = state.last_number,
                "Pool full, deferring write-behind"
            );
            crate::metrics::record_write_behind("deferred");
            merge_forward(&self.deferred, &period, state);
        }
        spawned
    }

    /// Try to start every deferred write-behind.
    fn flush_deferred(&self) {
        if self.deferred.is_empty() || self.pool.in_flight() >= self.pool.capacity() {
            return;
        }
        let held: Vec<(PeriodKey, SequenceState)> =
            self.deferred.iter().map(|e| (e.key().clone(), *e.value())).collect();
        for (period, state) in held {
            if !self.spawn_write_behind(period, state) {
                break;
            }
        }
    }

    /// Remember that the table moved past the cache for `period`.
    pub fn mark_unpublished(&self, period: &PeriodKey) {
        self.unpublished.insert(period.clone());
    }

    #[must_use]
    pub fn is_unpublished(&self, period: &PeriodKey) -> bool {
        self.unpublished.contains(period)
    }

    /// Publish the durable row for a period marked unpublished. The mark is
    /// kept if the cache cannot be reached.
    pub async fn reconcile(&self, period: &PeriodKey) -> Result<(), StorageError> {
        if self.unpublished.remove(period).is_none() {
            return Ok(());
        }
        if let Err(e) = self.warm_up(period).await {
            self.mark_unpublished(period);
            return Err(e);
        }
        info!(period = %period, "Cache reconciled with durable row");
        Ok(())
    }

    pub fn pool(&self) -> &BackgroundPool {
        &self.pool
    }

    /// Wait until every write-behind, deferred ones included, has finished.
    pub async fn wait_idle(&self) {
        loop {
            self.pool.wait_idle().await;
            if self.deferred.is_empty() {
                return;
            }
            self.flush_deferred();
        }
    }
}

/// Keep the later of the held state and `state`.
fn merge_forward(
    map: &DashMap<PeriodKey, SequenceState>,
    period: &PeriodKey,
    state: SequenceState,
) {
    map.entry(period.clone())
        .and_modify(|held| *held = SequenceState::max_of(*held, state))
        .or_insert(state);
}
