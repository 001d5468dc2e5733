// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request API of the engine.
//!
//! - `generate_code()` / `generate_code_for_year()` - allocate a patient code
//! - `check_duplicate()` - rank possible duplicates before creating a patient
//! - `register_patient()` - commit a patient row through the same store
//! - `warm_up()` / `sequence_usage()` / `tenant_usage()` - period inspection
//! - `wait_idle()` - drain pending write-behinds
//!
//! Every call is refused with a `BackendUnavailable` error unless the
//! engine is `Ready`.

use tracing::debug;

use crate::allocator::{Allocation, AllocationError, PatientCodeAllocator, SequenceUsage};
use crate::duplicates::{DuplicateCheckError, DuplicateDetector, DuplicateQuery, DuplicateReport};
use crate::sequence::AllocatedCode;
use crate::storage::traits::{PatientRecord, StorageError};

use super::{EngineState, PatientIdEngine};

impl PatientIdEngine {
    fn ready_allocator(&self) -> Result<&PatientCodeAllocator, AllocationError> {
        match (self.state(), self.allocator.as_ref()) {
            (EngineState::Ready, Some(allocator)) => Ok(allocator),
            (state, _) => Err(AllocationError::BackendUnavailable(format!("engine is {}", state))),
        }
    }

    fn ready_detector(&self) -> Result<&DuplicateDetector, DuplicateCheckError> {
        match (self.state(), self.detector.as_ref()) {
            (EngineState::Ready, Some(detector)) => Ok(detector),
            (state, _) => Err(DuplicateCheckError::BackendUnavailable(format!("engine is {}", state))),
        }
    }

    /// Next patient code for `tenant` in the current UTC year.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use patient_id_engine::PatientIdEngine;
    /// # async fn example(engine: &PatientIdEngine) {
    /// let code = engine.generate_code("CENTREA").await.unwrap();
    /// assert!(code.to_string().starts_with("CENTREA-"));
    /// # }
    /// ```
    pub async fn generate_code(&self, tenant: &str) -> Result<AllocatedCode, AllocationError> {
        self.ready_allocator()?.generate_code(tenant).await
    }

    pub async fn generate_code_for_year(&self, tenant: &str, year: i32) -> Result<AllocatedCode, AllocationError> {
        self.ready_allocator()?.generate_code_for_year(tenant, year).await
    }

    /// Like [`generate_code_for_year`](Self::generate_code_for_year), with the
    /// state and serving path.
    pub async fn allocate(&self, tenant: &str, year: i32) -> Result<Allocation, AllocationError> {
        self.ready_allocator()?.allocate(tenant, year).await
    }

    pub async fn check_duplicate(&self, query: &DuplicateQuery) -> Result<DuplicateReport, DuplicateCheckError> {
        self.ready_detector()?.check_duplicate(query).await
    }

    /// Insert or replace a patient row in the directory the scorer reads.
    pub async fn register_patient(&self, record: &PatientRecord) -> Result<(), StorageError> {
        let backends = match (self.state(), self.backends.as_ref()) {
            (EngineState::Ready, Some(backends)) => backends,
            (state, _) => return Err(StorageError::Backend(format!("engine is {}", state))),
        };
        backends.directory.register_patient(record).await?;
        debug!(patient = %record.id, code = %record.patient_code, "Patient registered");
        Ok(())
    }

    pub async fn warm_up(&self, tenant: &str, year: i32) -> Result<Option<SequenceUsage>, AllocationError> {
        self.ready_allocator()?.warm_up(tenant, year).await
    }

    pub async fn sequence_usage(&self, tenant: &str, year: i32) -> Result<SequenceUsage, AllocationError> {
        self.ready_allocator()?.sequence_usage(tenant, year).await
    }

    pub async fn tenant_usage(&self, tenant: &str) -> Result<Vec<SequenceUsage>, AllocationError> {
        self.ready_allocator()?.tenant_usage(tenant).await
    }

    /// Wait until every scheduled write-behind has reached the table.
    pub async fn wait_idle(&self) {
        if let Some(ref allocator) = self.allocator {
            allocator.wait_idle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use crate::config::PatientIdConfig;
    use crate::coordinator::{Backends, EngineState, PatientIdEngine};
    use crate::duplicates::{DuplicateQuery, Recommendation};
    use crate::storage::memory::InMemoryCache;
    use crate::storage::sql::SqlStore;
    use crate::storage::traits::{PatientRecord, SequenceCache};
    use crate::allocator::AllocationError;

    async fn engine() -> (TempDir, PatientIdEngine) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("engine.db").display());
        let store = Arc::new(SqlStore::new(&url).await.unwrap());
        let cache: Arc<dyn SequenceCache> = Arc::new(InMemoryCache::new());

        let mut engine = PatientIdEngine::new(PatientIdConfig::default());
        engine.start_with(Backends::sql(store, Some(cache)));
        (dir, engine)
    }

    #[tokio::test]
    async fn test_requests_refused_until_ready() {
        let engine = PatientIdEngine::new(PatientIdConfig::default());
        assert_eq!(engine.state(), EngineState::Created);

        let err = engine.generate_code("CENTREA").await.unwrap_err();
        assert!(matches!(err, AllocationError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_start_requires_sql_url() {
        let mut engine = PatientIdEngine::new(PatientIdConfig::default());
        assert!(engine.start().await.is_err());
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[tokio::test]
    async fn test_start_from_config_without_redis() {
        let dir = TempDir::new().unwrap();
        let config = PatientIdConfig {
            sql_url: Some(format!("sqlite://{}?mode=rwc", dir.path().join("cfg.db").display())),
            ..Default::default()
        };
        let mut engine = PatientIdEngine::new(config);
        engine.start().await.unwrap();

        assert!(engine.is_ready());
        let health = engine.health_check().await;
        assert!(health.healthy);
        assert!(!health.fast_path_enabled);
        assert_eq!(health.cache_connected, None);
        assert_eq!(health.sql_connected, Some(true));

        let code = engine.generate_code_for_year("CENTREA", 2025).await.unwrap();
        assert_eq!(code.to_string(), "CENTREA-2025-001-AAA");
    }

    #[tokio::test]
    async fn test_lifecycle_and_health() {
        let (_dir, engine) = engine().await;
        let mut states = engine.state_receiver();
        assert!(engine.is_ready());

        let health = engine.health_check().await;
        assert!(health.healthy);
        assert!(health.fast_path_enabled);
        assert_eq!(health.cache_connected, Some(true));

        engine.generate_code_for_year("CENTREA", 2025).await.unwrap();
        engine.generate_code_for_year("CENTREA", 2025).await.unwrap();
        engine.shutdown().await;

        assert_eq!(*states.borrow_and_update(), EngineState::Stopped);
        assert!(!engine.health_check().await.healthy);
        assert!(engine.generate_code_for_year("CENTREA", 2025).await.is_err());
    }

    #[tokio::test]
    async fn test_register_then_check_duplicate() {
        let (_dir, engine) = engine().await;
        let code = engine.generate_code_for_year("CENTREA", 2025).await.unwrap();
        let born = NaiveDate::from_ymd_opt(1990, 6, 15).unwrap();

        engine
            .register_patient(&PatientRecord {
                id: "p-1".into(),
                tenant_code: "CENTREA".into(),
                patient_code: code.to_string(),
                nom: "KOUASSI".into(),
                prenoms: "Yves".into(),
                date_naissance: born,
                telephone: Some("+225 07 12 34 56 78".into()),
            })
            .await
            .unwrap();

        let report = engine
            .check_duplicate(&DuplicateQuery::new("Kouassi", "Yves", born).telephone("+2250712345678"))
            .await
            .unwrap();

        assert_eq!(report.recommendation, Recommendation::Block);
        assert_eq!(report.candidates[0].patient.patient_code, "CENTREA-2025-001-AAA");
    }

    #[tokio::test]
    async fn test_usage_through_engine() {
        let (_dir, engine) = engine().await;
        for _ in 0..3 {
            engine.generate_code_for_year("CENTREA", 2025).await.unwrap();
        }

        let usage = engine.sequence_usage("CENTREA", 2025).await.unwrap();
        assert_eq!(usage.generated_count, 3);
        assert_eq!(usage.last_code.unwrap().to_string(), "CENTREA-2025-003-AAA");

        engine.shutdown().await;
    }
}
