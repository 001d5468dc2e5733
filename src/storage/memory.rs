// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process stand-ins for Redis and the patient table.
//!
//! [`InMemoryCache`] honours TTLs lazily (expired entries read as absent)
//! and makes compare-and-set/lock operations atomic through the DashMap
//! entry API. Used by single-process deployments and tests.

use std::collections::HashSet;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{
    phone_digits, phone_tail, CandidateFilter, NameBlock, PatientDirectory, PatientRecord,
    SequenceCache, StorageError,
};
use crate::duplicates::trigram::trigram_keys;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

pub struct InMemoryCache {
    data: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Live entry count
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| e.value().live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything, as if the cache had been flushed or restarted
    pub fn clear(&self) {
        self.data.clear();
    }

    /// Remaining TTL of a live key
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.expires_at - now)
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SequenceCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        Ok(self
            .data
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.data.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let now = Instant::now();
        let fresh = CacheEntry {
            value: value.to_string(),
            expires_at: now + ttl,
        };
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|e| e.live(now))
                    .map(|e| e.value.as_str());
                if current != expected {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StorageError> {
        let now = Instant::now();
        let fresh = CacheEntry {
            value: token.to_string(),
            expires_at: now + ttl,
        };
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live(now) {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        Ok(self
            .data
            .remove_if(key, |_, e| e.live(now) && e.value == token)
            .is_some())
    }
}

/// Patient table kept in a Vec, applying the same blocking rules as the
/// SQL pre-filter.
#[derive(Default)]
pub struct InMemoryDirectory {
    patients: RwLock<Vec<PatientRecord>>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patients.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patients.read().is_empty()
    }

    fn phone_matches(record: &PatientRecord, filter: &CandidateFilter) -> bool {
        let digits = record.telephone.as_deref().map(phone_digits).unwrap_or_default();
        if digits.is_empty() {
            return false;
        }
        if filter.phone_digits.as_deref() == Some(digits.as_str()) {
            return true;
        }
        matches!(
            (filter.phone_tail.as_deref(), phone_tail(&digits)),
            (Some(tail), Some(own)) if tail == own
        )
    }

    fn name_matches(value: &str, block: Option<&NameBlock>) -> bool {
        let Some(block) = block else {
            return false;
        };
        let own: HashSet<String> = trigram_keys(value).into_iter().collect();
        block.trigrams.iter().filter(|t| own.contains(*t)).count() >= block.min_shared
    }
}

#[async_trait]
impl PatientDirectory for InMemoryDirectory {
    async fn register_patient(&self, record: &PatientRecord) -> Result<(), StorageError> {
        let mut patients = self.patients.write();
        match patients.iter_mut().find(|p| p.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => patients.push(record.clone()),
        }
        Ok(())
    }

    async fn find_candidates(&self, filter: &CandidateFilter) -> Result<Vec<PatientRecord>, StorageError> {
        let patients = self.patients.read();
        let mut matched = Vec::new();
        let mut by_date = Vec::new();

        for record in patients.iter() {
            if let Some(ref tenant) = filter.tenant_code {
                if &record.tenant_code != tenant {
                    continue;
                }
            }
            if Self::phone_matches(record, filter)
                || Self::name_matches(&record.nom, filter.nom.as_ref())
                || Self::name_matches(&record.prenoms, filter.prenoms.as_ref())
            {
                matched.push(record.clone());
            } else if record.date_naissance >= filter.born_from
                && record.date_naissance <= filter.born_to
            {
                by_date.push(record);
            }
        }

        by_date.sort_by_key(|r| {
            let distance = (r.date_naissance - filter.born_on).num_days().abs();
            (distance, r.id.clone())
        });
        matched.extend(by_date.into_iter().take(filter.date_limit).cloned());
        Ok(matched)
    }
}
