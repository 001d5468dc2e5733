// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Weighted duplicate scoring.
//!
//! Candidates are fetched by cheap blocking keys, then filtered exactly and
//! scored in Rust. Phone and name-trigram matches are fetched in full; the
//! birth-date window alone is capped at `candidate_scan_limit`, closest
//! dates first. The name block asks for enough shared trigrams to possibly
//! clear the trigram floor, so it never drops a record the exact filter
//! would keep.
//!
//!
//! | score   | rule                                                   |
//! |---------|--------------------------------------------------------|
//! | name    | max(trigram(nom), trigram(prenoms)) × 100              |
//! | date    | 100 same day, 90 ≤ 7 days, 70 ≤ 30, 30 ≤ 365, else 0   |
//! | phone   | 100 same digits, 80 same last 8 digits, else 0         |
//! | global  | round(0.4 × name + 0.4 × date + 0.2 × phone)           |
//!
//! Read-only: no locks, no writes.

use std::sync::Arc;
use chrono::{Duration as ChronoDuration, NaiveDate};
use thiserror::Error;
use tracing::{debug, warn};

use super::trigram::{min_shared_trigrams, similarity, trigram_keys};
use crate::config::ScoringConfig;
use crate::storage::traits::{
    phone_digits, phone_tail, CandidateFilter, NameBlock, PatientDirectory, PatientRecord,
    StorageError,
};

/// Days either side of the birth date that still score.
const DATE_WINDOW_DAYS: i64 = 365;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DuplicateCheckError {
    #[error("Invalid duplicate query: {0}")]
    Validation(String),

    #[error("Patient directory unavailable: {0}")]
    BackendUnavailable(String),
}

impl From<StorageError> for DuplicateCheckError {
    fn from(e: StorageError) -> Self {
        Self::BackendUnavailable(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Recommendation {
    Allow,
    Warn,
    Block,
}

impl Recommendation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Warn => "WARN",
            Self::Block => "BLOCK",
        }
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a patient about to be created.
#[derive(Debug, Clone)]
pub struct DuplicateQuery {
    pub nom: String,
    pub prenoms: String,
    pub date_naissance: NaiveDate,
    pub telephone: Option<String>,
    /// Candidates scoring below this are dropped
    pub score_minimum: u8,
    pub limit: usize,
    /// Restrict candidates to one tenant
    pub tenant_code: Option<String>,
}

impl DuplicateQuery {
    pub fn new(nom: impl Into<String>, prenoms: impl Into<String>, date_naissance: NaiveDate) -> Self {
        Self {
            nom: nom.into(),
            prenoms: prenoms.into(),
            date_naissance,
            telephone: None,
            score_minimum: 50,
            limit: 10,
            tenant_code: None,
        }
    }

    #[must_use]
    pub fn telephone(mut self, telephone: impl Into<String>) -> Self {
        self.telephone = Some(telephone.into());
        self
    }

    #[must_use]
    pub fn score_minimum(mut self, score_minimum: u8) -> Self {
        self.score_minimum = score_minimum;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn tenant(mut self, tenant_code: impl Into<String>) -> Self {
        self.tenant_code = Some(tenant_code.into().trim().to_ascii_uppercase());
        self
    }

    fn phone_digits(&self) -> Option<String> {
        self.telephone
            .as_deref()
            .map(phone_digits)
            .filter(|d| !d.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCandidate {
    pub patient: PatientRecord,
    pub global_score: u8,
    pub name_score: f64,
    pub date_score: f64,
    pub phone_score: f64,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateReport {
    /// Best match first
    pub candidates: Vec<DuplicateCandidate>,
    /// Recommendation of the best candidate, `Allow` when there is none
    pub recommendation: Recommendation,
    /// Rows returned by the pre-filter
    pub scanned: usize,
}

fn date_score(a: NaiveDate, b: NaiveDate) -> f64 {
    match (a - b).num_days().abs() {
        0 => 100.0,
        1..=7 => 90.0,
        8..=30 => 70.0,
        31..=DATE_WINDOW_DAYS => 30.0,
        _ => 0.0,
    }
}

fn phone_score(query_digits: Option<&str>, telephone: Option<&str>) -> f64 {
    let (Some(query), Some(telephone)) = (query_digits, telephone) else {
        return 0.0;
    };
    let candidate = phone_digits(telephone);
    if candidate.is_empty() {
        return 0.0;
    }
    if query == candidate {
        return 100.0;
    }
    match (phone_tail(query), phone_tail(&candidate)) {
        (Some(a), Some(b)) if a == b => 80.0,
        _ => 0.0,
    }
}

pub struct DuplicateDetector {
    directory: Arc<dyn PatientDirectory>,
    config: ScoringConfig,
}

impl DuplicateDetector {
    pub fn new(directory: Arc<dyn PatientDirectory>, config: ScoringConfig) -> Self {
        Self { directory, config }
    }

    #[must_use]
    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    #[must_use]
    pub fn recommend(&self, global_score: u8) -> Recommendation {
        if global_score >= self.config.block_threshold {
            Recommendation::Block
        } else if global_score >= self.config.warn_threshold {
            Recommendation::Warn
        } else {
            Recommendation::Allow
        }
    }

    /// Score one record against the query.
    #[must_use]
    pub fn score(&self, query: &DuplicateQuery, record: &PatientRecord) -> DuplicateCandidate {
        let name_similarity = similarity(&query.nom, &record.nom).max(similarity(&query.prenoms, &record.prenoms));
        let name_score = name_similarity * 100.0;
        let date_score = date_score(query.date_naissance, record.date_naissance);
        let phone_score = phone_score(query.phone_digits().as_deref(), record.telephone.as_deref());

        let weighted = self.config.name_weight * name_score
            + self.config.date_weight * date_score
            + self.config.phone_weight * phone_score;
        let global_score = weighted.round().clamp(0.0, 100.0) as u8;

        DuplicateCandidate {
            patient: record.clone(),
            global_score,
            name_score,
            date_score,
            phone_score,
            recommendation: self.recommend(global_score),
        }
    }

    /// Whether a scored record passes the exact pre-filter: a name above
    /// the trigram floor, a birth date within a year, or a phone match.
    fn is_candidate(&self, scored: &DuplicateCandidate) -> bool {
        scored.name_score > self.config.trigram_floor * 100.0
            || scored.date_score > 0.0
            || scored.phone_score > 0.0
    }

    /// Trigram block for one query name; `None` when it has no words.
    fn name_block(&self, name: &str) -> Option<NameBlock> {
        let trigrams = trigram_keys(name);
        if trigrams.is_empty() {
            return None;
        }
        let min_shared = min_shared_trigrams(trigrams.len(), self.config.trigram_floor);
        Some(NameBlock { trigrams, min_shared })
    }

    fn candidate_filter(&self, query: &DuplicateQuery) -> CandidateFilter {
        let window = ChronoDuration::days(DATE_WINDOW_DAYS);
        let digits = query.phone_digits();
        CandidateFilter {
            tenant_code: query.tenant_code.clone(),
            born_on: query.date_naissance,
            born_from: query.date_naissance - window,
            born_to: query.date_naissance + window,
            phone_tail: digits.as_deref().and_then(phone_tail).map(str::to_string),
            phone_digits: digits,
            nom: self.name_block(&query.nom),
            prenoms: self.name_block(&query.prenoms),
            date_limit: self.config.candidate_scan_limit,
        }
    }

    /// Rank existing patients that may be the same person as `query`.
    #[tracing::instrument(skip(self, query), fields(tenant = ?query.tenant_code))]
    pub async fn check_duplicate(&self, query: &DuplicateQuery) -> Result<DuplicateReport, DuplicateCheckError> {
        if query.nom.trim().is_empty() && query.prenoms.trim().is_empty() {
            return Err(DuplicateCheckError::Validation("nom and prenoms are both empty".into()));
        }
        if query.score_minimum > 100 {
            return Err(DuplicateCheckError::Validation(format!(
                "score minimum {} is above 100",
                query.score_minimum
            )));
        }
        if query.limit == 0 {
            return Err(DuplicateCheckError::Validation("limit must be at least 1".into()));
        }

        let _timer = crate::metrics::LatencyTimer::new("check_duplicate");
        let filter = self.candidate_filter(query);
        let records = self.directory.find_candidates(&filter).await.map_err(|e| {
            warn!(error = %e, "Duplicate pre-filter failed");
            crate::metrics::record_error("database", "find_candidates");
            DuplicateCheckError::from(e)
        })?;
        let scanned = records.len();

        let mut candidates: Vec<DuplicateCandidate> = records
            .iter()
            .map(|record| self.score(query, record))
            .filter(|scored| self.is_candidate(scored) && scored.global_score >= query.score_minimum)
            .collect();
        candidates.sort_by(|a, b| b.global_score.cmp(&a.global_score));
        candidates.truncate(query.limit);

        let recommendation = candidates
            .first()
            .map_or(Recommendation::Allow, |c| c.recommendation);

        crate::metrics::record_duplicate_candidates(scanned);
        crate::metrics::record_duplicate_check(recommendation.as_str());
        debug!(scanned, matched = candidates.len(), %recommendation, "Duplicate check complete");

        Ok(DuplicateReport {
            candidates,
            recommendation,
            scanned,
        })
    }
}
