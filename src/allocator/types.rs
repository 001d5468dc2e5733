// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types of the allocator.

use thiserror::Error;

use crate::sequence::{AllocatedCode, PeriodKey, SequenceError, SequenceState, PERIOD_CAPACITY};
use crate::storage::traits::StorageError;

/// Errors surfaced by [`super::PatientCodeAllocator`].
///
/// Only `Validation`, `CapacityExceeded` and durable-path failures reach
/// callers in practice: fast-path `BackendUnavailable`, `LockTimeout` and
/// `StateCorrupt` are recovered by falling back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Patient code capacity exhausted for {period}")]
    CapacityExceeded { period: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Timed out waiting for sequence lock: {0}")]
    LockTimeout(String),

    #[error("Corrupt sequence state: {0}")]
    StateCorrupt(String),
}

impl From<SequenceError> for AllocationError {
    fn from(e: SequenceError) -> Self {
        match e {
            SequenceError::CapacityExhausted => Self::CapacityExceeded {
                period: "unknown period".to_string(),
            },
            SequenceError::Malformed(raw) => Self::StateCorrupt(raw),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<StorageError> for AllocationError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::CapacityExhausted(period) => Self::CapacityExceeded { period },
            StorageError::Corruption { key, value } => {
                Self::StateCorrupt(format!("{} = {:?}", key, value))
            }
            StorageError::Backend(msg) | StorageError::Conflict(msg) => Self::BackendUnavailable(msg),
        }
    }
}

impl AllocationError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::CapacityExceeded { .. } => "exhausted",
            Self::BackendUnavailable(_) => "unavailable",
            Self::LockTimeout(_) => "lock_timeout",
            Self::StateCorrupt(_) => "corrupt",
        }
    }
}

/// Which path served an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPath {
    /// Advanced in the cache under the distributed lock
    Fast,
    /// Advanced in the durable table (fallback or cache cold start)
    Durable,
}

impl AllocationPath {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Durable => "durable",
        }
    }
}

impl std::fmt::Display for AllocationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub code: AllocatedCode,
    pub state: SequenceState,
    pub path: AllocationPath,
}

/// Consumption of one sequence period.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceUsage {
    pub tenant: String,
    pub year: i32,
    /// Allocations performed, discarded ones included
    pub generated_count: u64,
    /// Most recently issued code, `None` before the first allocation
    pub last_code: Option<AllocatedCode>,
    /// Codes left before `CapacityExceeded`
    pub remaining: u64,
    /// Issued share of the period capacity, 0.0 to 1.0
    pub utilisation: f64,
}

impl SequenceUsage {
    #[must_use]
    pub fn from_state(period: &PeriodKey, state: &SequenceState) -> Self {
        Self {
            tenant: period.tenant().to_string(),
            year: period.year(),
            generated_count: state.generated_count,
            last_code: (state.ordinal() > 0).then(|| state.code(period)),
            remaining: state.remaining(),
            utilisation: state.ordinal() as f64 / PERIOD_CAPACITY as f64,
        }
    }
}
