// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Duplicate patient detection.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::NaiveDate;
//! use patient_id_engine::{DuplicateDetector, DuplicateQuery, InMemoryDirectory, ScoringConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let detector = DuplicateDetector::new(Arc::new(InMemoryDirectory::new()), ScoringConfig::default());
//! let query = DuplicateQuery::new("KOUASSI", "Yves", NaiveDate::from_ymd_opt(1990, 6, 15).unwrap())
//!     .telephone("07 12 34 56 78")
//!     .score_minimum(70)
//!     .limit(5);
//!
//! let report = detector.check_duplicate(&query).await.unwrap();
//! println!("{} ({} candidates)", report.recommendation, report.candidates.len());
//! # }
//! ```

mod scorer;
pub mod trigram;

pub use scorer::{
    DuplicateCandidate, DuplicateCheckError, DuplicateDetector, DuplicateQuery, DuplicateReport,
    Recommendation,
};
