// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local mutual exclusion per sequence period.
//!
//! Serializes durable allocations inside one process so they queue on a
//! tokio mutex instead of piling up as conflicting transactions. Entries
//! are created on first use and never pruned; the registry grows with the
//! number of distinct (tenant, year) pairs.

use std::sync::Arc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::sequence::PeriodKey;

#[derive(Default)]
pub struct MutexRegistry {
    locks: DashMap<PeriodKey, Arc<Mutex<()>>>,
}

impl MutexRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `period`. Released when the guard drops.
    pub async fn lock(&self, period: &PeriodKey) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard lock is not held across the await
        let mutex = self
            .locks
            .entry(period.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Periods seen so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn period(tenant: &str, year: i32) -> PeriodKey {
        PeriodKey::new(tenant, year).unwrap()
    }

    #[tokio::test]
    async fn test_same_period_is_exclusive() {
        let registry = Arc::new(MutexRegistry::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let registry = registry.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.lock(&period("CENTREA", 2025)).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_periods_do_not_block() {
        let registry = MutexRegistry::new();

        let _a = registry.lock(&period("CENTREA", 2025)).await;
        let b = tokio::time::timeout(Duration::from_millis(100), registry.lock(&period("CENTREA", 2026))).await;
        let c = tokio::time::timeout(Duration::from_millis(100), registry.lock(&period("CENTREB", 2025))).await;

        assert!(b.is_ok());
        assert!(c.is_ok());
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let registry = MutexRegistry::new();
        drop(registry.lock(&period("CENTREA", 2025)).await);

        let again = tokio::time::timeout(Duration::from_millis(100), registry.lock(&period("centrea", 2025))).await;
        assert!(again.is_ok());
        assert_eq!(registry.len(), 1);
    }
}
