// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sequence state and patient codes.
//!
//! A [`SequenceState`] is the counter for one sequence period (tenant +
//! calendar year). Every allocation advances it by the rollover rule:
//!
//! ```text
//! 001-AAA → 002-AAA → … → 999-AAA → 001-AAB → … → 999-ZZZ → CapacityExceeded
//! ```
//!
//! The state renders as an [`AllocatedCode`] such as `CENTREA-2025-001-AAA`.
//!
//! # Example
//!
//! ```
//! use patient_id_engine::sequence::{PeriodKey, SequenceState};
//!
//! let period = PeriodKey::new("centrea", 2025).unwrap();
//! let first = SequenceState::fresh().advance().unwrap();
//! assert_eq!(first.code(&period).to_string(), "CENTREA-2025-001-AAA");
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Highest number issued before the suffix rolls over.
pub const MAX_NUMBER: u16 = 999;

/// Maximum tenant code length accepted by the allocator.
pub const MAX_TENANT_LEN: usize = 20;

/// Number of distinct three-letter suffixes.
pub const SUFFIX_SPACE: u32 = 26 * 26 * 26;

/// Hard ceiling of codes per tenant per year (999 × 26³).
pub const PERIOD_CAPACITY: u64 = MAX_NUMBER as u64 * SUFFIX_SPACE as u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Invalid tenant code '{0}': {1}")]
    InvalidTenant(String, &'static str),
    #[error("Sequence capacity exhausted at 999-ZZZ")]
    CapacityExhausted,
    #[error("Malformed sequence value '{0}'")]
    Malformed(String),
    #[error("Malformed patient code '{0}'")]
    InvalidCode(String),
}

/// Trim, upper-case and validate a tenant code.
///
/// Only `[A-Z0-9_]` survives: `-` separates code fields and `:` separates
/// cache key fields.
pub fn normalize_tenant(raw: &str) -> Result<String, SequenceError> {
    let tenant = raw.trim().to_ascii_uppercase();
    if tenant.is_empty() {
        return Err(SequenceError::InvalidTenant(raw.to_string(), "must not be empty"));
    }
    if tenant.chars().count() > MAX_TENANT_LEN {
        return Err(SequenceError::InvalidTenant(raw.to_string(), "longer than 20 characters"));
    }
    if !tenant.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SequenceError::InvalidTenant(
            raw.to_string(),
            "only letters, digits and '_' are allowed",
        ));
    }
    Ok(tenant)
}

/// A sequence period: one counter per tenant per calendar year.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodKey {
    tenant: String,
    year: i32,
}

impl PeriodKey {
    /// Build a period, normalizing the tenant code.
    pub fn new(tenant: &str, year: i32) -> Result<Self, SequenceError> {
        Ok(Self {
            tenant: normalize_tenant(tenant)?,
            year,
        })
    }

    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    #[must_use]
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Cache key holding the packed state: `<ns>_<tenant>_patient_sequence:<year>`
    #[must_use]
    pub fn state_key(&self, namespace: &str) -> String {
        format!("{}_{}_patient_sequence:{}", namespace, self.tenant, self.year)
    }

    /// Cache key of the fast-path lock: `<ns>_<tenant>_patient_sequence_lock:<year>`
    #[must_use]
    pub fn lock_key(&self, namespace: &str) -> String {
        format!("{}_{}_patient_sequence_lock:{}", namespace, self.tenant, self.year)
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.year)
    }
}

/// Three-letter suffix, a base-26 counter over `AAA..=ZZZ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Suffix([u8; 3]);

impl Suffix {
    pub const FIRST: Suffix = Suffix(*b"AAA");
    pub const LAST: Suffix = Suffix(*b"ZZZ");

    /// Parse an upper-case three-letter suffix.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_uppercase) {
            return None;
        }
        Some(Self([bytes[0], bytes[1], bytes[2]]))
    }

    /// Position in `AAA..=ZZZ` (AAA = 0, ZZZ = 17575).
    #[must_use]
    pub fn index(&self) -> u32 {
        self.0
            .iter()
            .fold(0u32, |acc, b| acc * 26 + u32::from(b - b'A'))
    }

    #[must_use]
    pub fn from_index(index: u32) -> Option<Self> {
        if index >= SUFFIX_SPACE {
            return None;
        }
        let mut out = [b'A'; 3];
        let mut rest = index;
        for slot in out.iter_mut().rev() {
            *slot = b'A' + (rest % 26) as u8;
            rest /= 26;
        }
        Some(Self(out))
    }

    /// Advance one tick, rightmost letter first. `None` past `ZZZ`.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        let mut out = self.0;
        for slot in out.iter_mut().rev() {
            if *slot < b'Z' {
                *slot += 1;
                return Some(Self(out));
            }
            *slot = b'A';
        }
        None
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // Constructed only from ASCII uppercase bytes
        std::str::from_utf8(&self.0).unwrap_or("AAA")
    }
}

impl fmt::Display for Suffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter state of one sequence period.
///
/// `last_number`/`last_suffix` describe the most recently issued code;
/// `0/AAA` means nothing has been issued yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceState {
    pub last_number: u16,
    pub last_suffix: Suffix,
    /// Allocations ever performed for the period, including discarded ones.
    pub generated_count: u64,
}

impl SequenceState {
    /// State of a period with nothing issued yet.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            last_number: 0,
            last_suffix: Suffix::FIRST,
            generated_count: 0,
        }
    }

    pub fn new(last_number: u16, last_suffix: Suffix, generated_count: u64) -> Result<Self, SequenceError> {
        if last_number > MAX_NUMBER || (last_number == 0 && last_suffix != Suffix::FIRST) {
            return Err(SequenceError::Malformed(format!("{}:{}", last_number, last_suffix)));
        }
        Ok(Self { last_number, last_suffix, generated_count })
    }

    /// Apply the rollover rule. `self` is never mutated, so a capacity
    /// failure leaves the caller's state intact.
    pub fn advance(&self) -> Result<Self, SequenceError> {
        let (last_number, last_suffix) = if self.last_number < MAX_NUMBER {
            (self.last_number + 1, self.last_suffix)
        } else {
            let suffix = self.last_suffix.next().ok_or(SequenceError::CapacityExhausted)?;
            (1, suffix)
        };
        Ok(Self {
            last_number,
            last_suffix,
            generated_count: self.generated_count + 1,
        })
    }

    /// Position in the period's sequence: number of codes up to and
    /// including this one (`fresh()` is 0, `999-ZZZ` is [`PERIOD_CAPACITY`]).
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        u64::from(self.last_suffix.index()) * u64::from(MAX_NUMBER) + u64::from(self.last_number)
    }

    /// Inverse of [`ordinal`](Self::ordinal).
    #[must_use]
    pub fn from_ordinal(ordinal: u64, generated_count: u64) -> Option<Self> {
        if ordinal == 0 {
            return Some(Self { generated_count, ..Self::fresh() });
        }
        if ordinal > PERIOD_CAPACITY {
            return None;
        }
        let zero_based = ordinal - 1;
        let suffix = Suffix::from_index((zero_based / u64::from(MAX_NUMBER)) as u32)?;
        let number = (zero_based % u64::from(MAX_NUMBER)) as u16 + 1;
        Some(Self { last_number: number, last_suffix: suffix, generated_count })
    }

    /// The later of two states (ties broken by the larger count).
    #[must_use]
    pub fn max_of(a: Self, b: Self) -> Self {
        match a.ordinal().cmp(&b.ordinal()) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            std::cmp::Ordering::Equal if a.generated_count >= b.generated_count => a,
            std::cmp::Ordering::Equal => b,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.last_number == MAX_NUMBER && self.last_suffix == Suffix::LAST
    }

    /// Codes still available in the period.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        PERIOD_CAPACITY - self.ordinal()
    }

    /// The code this state stands for within `period`.
    #[must_use]
    pub fn code(&self, period: &PeriodKey) -> AllocatedCode {
        AllocatedCode {
            tenant: period.tenant.clone(),
            year: period.year,
            number: self.last_number,
            suffix: self.last_suffix,
        }
    }

    /// Cache encoding: `"{number}:{suffix}:{count}"`.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.last_number, self.last_suffix, self.generated_count)
    }

    /// Parse the cache encoding. The two-field `"{number}:{suffix}"` form
    /// written by older deployments is accepted; its count is taken to be
    /// the ordinal.
    pub fn decode(raw: &str) -> Result<Self, SequenceError> {
        let malformed = || SequenceError::Malformed(raw.to_string());
        let mut parts = raw.trim().split(':');
        let number: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let suffix = parts.next().and_then(Suffix::parse).ok_or_else(malformed)?;
        let count: Option<u64> = match parts.next() {
            Some(p) => Some(p.parse().map_err(|_| malformed())?),
            None => None,
        };
        if parts.next().is_some() {
            return Err(malformed());
        }
        let mut state = Self::new(number, suffix, 0).map_err(|_| malformed())?;
        state.generated_count = count.unwrap_or_else(|| state.ordinal());
        Ok(state)
    }
}

impl Default for SequenceState {
    fn default() -> Self {
        Self::fresh()
    }
}

/// A formatted patient code: `{TENANT}-{YYYY}-{NNN}-{LLL}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocatedCode {
    pub tenant: String,
    pub year: i32,
    pub number: u16,
    pub suffix: Suffix,
}

impl AllocatedCode {
    /// Parse a code such as `CENTREA-2025-001-AAA`.
    pub fn parse(s: &str) -> Result<Self, SequenceError> {
        let invalid = || SequenceError::InvalidCode(s.to_string());
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 {
            return Err(invalid());
        }
        let tenant = normalize_tenant(parts[0]).map_err(|_| invalid())?;
        if tenant != parts[0] || parts[1].len() != 4 || parts[2].len() != 3 {
            return Err(invalid());
        }
        let year: i32 = parts[1].parse().map_err(|_| invalid())?;
        let number: u16 = parts[2].parse().map_err(|_| invalid())?;
        if number == 0 || number > MAX_NUMBER {
            return Err(invalid());
        }
        let suffix = Suffix::parse(parts[3]).ok_or_else(invalid)?;
        Ok(Self { tenant, year, number, suffix })
    }

    /// Position of this code within its period (1-based).
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        u64::from(self.suffix.index()) * u64::from(MAX_NUMBER) + u64::from(self.number)
    }
}

impl fmt::Display for AllocatedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04}-{:03}-{}", self.tenant, self.year, self.number, self.suffix)
    }
}

impl FromStr for AllocatedCode {
    type Err = SequenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
