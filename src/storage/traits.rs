// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage capability traits.
//!
//! The allocator only talks to these seams, so Redis/SQL can be swapped for
//! the in-memory implementations (or failure-injecting wrappers) in tests.

use std::time::Duration;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::sequence::{PeriodKey, SequenceState};

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Lost a race against a concurrent writer; safe to retry.
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Sequence capacity exhausted for {0}")]
    CapacityExhausted(String),
    #[error("Corrupt sequence state at '{key}': {value:?}")]
    Corruption {
        key: String,
        value: String,
    },
}

impl StorageError {
    /// Transient errors worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("deadlock")
                    || msg.contains("database is locked")
                    || msg.contains("busy")
                    || msg.contains("serializ")
                    || msg.contains("lock wait timeout")
            }
            _ => false,
        }
    }
}

/// Volatile key/value cache with TTLs and a self-expiring lock primitive.
#[async_trait]
pub trait SequenceCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Atomically replace `key` with `value` if it currently holds `expected`
    /// (`None` = key absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Take `key` as a lock owned by `token` unless someone else holds it.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Release the lock only if `token` still owns it.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Durable, authoritative sequence table.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn load(&self, period: &PeriodKey) -> Result<Option<SequenceState>, StorageError>;

    /// Issue the next state in one serializable transaction, starting from
    /// the later of the stored row and `floor`.
    ///
    /// Fails with [`StorageError::CapacityExhausted`] without writing when
    /// the period is full.
    async fn allocate(
        &self,
        period: &PeriodKey,
        floor: Option<SequenceState>,
    ) -> Result<SequenceState, StorageError>;

    /// Monotonic upsert: the row only moves forward. Returns whether it moved.
    async fn record(&self, period: &PeriodKey, state: &SequenceState) -> Result<bool, StorageError>;

    /// All periods of a tenant, newest year first.
    async fn list_periods(&self, tenant: &str) -> Result<Vec<(i32, SequenceState)>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Identity-adjacent view of a committed patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientRecord {
    pub id: String,
    pub tenant_code: String,
    pub patient_code: String,
    pub nom: String,
    pub prenoms: String,
    pub date_naissance: NaiveDate,
    pub telephone: Option<String>,
}

/// Trigram block on one name field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameBlock {
    /// Lower-case trigrams of the query name
    pub trigrams: Vec<String>,
    /// Shared trigrams a stored name needs to qualify
    pub min_shared: usize,
}

/// Blocking criteria for the duplicate pre-filter. A record qualifies when
/// it matches any one of them.
///
/// Phone and name matches are returned in full. Records that only match on
/// birth date are ranked by distance from `born_on` and cut at `date_limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFilter {
    pub tenant_code: Option<String>,
    pub born_on: NaiveDate,
    pub born_from: NaiveDate,
    pub born_to: NaiveDate,
    /// Full digit string of the phone number
    pub phone_digits: Option<String>,
    /// Last 8 digits of the phone number
    pub phone_tail: Option<String>,
    pub nom: Option<NameBlock>,
    pub prenoms: Option<NameBlock>,
    pub date_limit: usize,
}

#[async_trait]
pub trait PatientDirectory: Send + Sync {
    async fn register_patient(&self, record: &PatientRecord) -> Result<(), StorageError>;

    async fn find_candidates(&self, filter: &CandidateFilter) -> Result<Vec<PatientRecord>, StorageError>;
}

/// Keep only the digits of a phone number.
#[must_use]
pub fn phone_digits(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Last 8 digits of a phone number, if it has that many.
#[must_use]
pub fn phone_tail(digits: &str) -> Option<&str> {
    (digits.len() >= 8).then(|| &digits[digits.len() - 8..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Conflict("cas".into()).is_transient());
        assert!(StorageError::Backend("Deadlock found when trying to get lock".into()).is_transient());
        assert!(StorageError::Backend("error returned from database: database is locked".into()).is_transient());
        assert!(!StorageError::Backend("connection refused".into()).is_transient());
        assert!(!StorageError::CapacityExhausted("X/2025".into()).is_transient());
    }

    #[test]
    fn test_phone_normalization() {
        let digits = phone_digits("+225 07 12-34-56-78");
        assert_eq!(digits, "2250712345678");
        assert_eq!(phone_tail(&digits), Some("12345678"));
        assert_eq!(phone_tail("1234567"), None);
    }
}
