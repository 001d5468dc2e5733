// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: start and shutdown.

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::allocator::PatientCodeAllocator;
use crate::duplicates::DuplicateDetector;
use crate::storage::redis::RedisCache;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{SequenceCache, StorageError};

use super::{Backends, EngineState, PatientIdEngine};

impl PatientIdEngine {
    /// Connect to the backends named in the configuration.
    ///
    /// Startup flow:
    /// 1. Connect to SQL (required, ground truth); tables are created if missing
    /// 2. Connect to Redis (optional); on failure run durable-only
    /// 3. Build the allocator and the detector → Ready
    #[tracing::instrument(skip(self), fields(has_redis, has_sql))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        let startup_start = Instant::now();
        info!("Starting patient identifier engine...");
        self.set_state(EngineState::Connecting);

        let Some(sql_url) = self.config.sql_url.clone() else {
            error!("No SQL URL configured - the sequence table is required");
            self.set_state(EngineState::Created);
            return Err(StorageError::Backend("sql_url is required".to_string()));
        };

        let store = match SqlStore::new(&sql_url).await {
            Ok(store) => {
                tracing::Span::current().record("has_sql", true);
                crate::metrics::set_backend_healthy("database", true);
                info!("SQL connected (ground truth)");
                Arc::new(store)
            }
            Err(e) => {
                tracing::Span::current().record("has_sql", false);
                error!(error = %e, "Failed to connect to SQL - this is required for startup");
                crate::metrics::set_backend_healthy("database", false);
                crate::metrics::record_error("database", "connect");
                self.set_state(EngineState::Created);
                return Err(e);
            }
        };

        let cache: Option<Arc<dyn SequenceCache>> = match self.config.redis_url.clone() {
            Some(redis_url) => match RedisCache::new(&redis_url).await {
                Ok(redis) => {
                    tracing::Span::current().record("has_redis", true);
                    crate::metrics::set_backend_healthy("cache", true);
                    info!("Redis connected (fast path)");
                    Some(Arc::new(redis) as Arc<dyn SequenceCache>)
                }
                Err(e) => {
                    tracing::Span::current().record("has_redis", false);
                    warn!(error = %e, "Failed to connect to Redis - allocating from SQL only");
                    crate::metrics::set_backend_healthy("cache", false);
                    crate::metrics::record_error("cache", "connect");
                    None
                }
            },
            None => {
                tracing::Span::current().record("has_redis", false);
                info!("No Redis URL configured - allocating from SQL only");
                None
            }
        };

        self.start_with(Backends::sql(store, cache));
        crate::metrics::record_startup_total(startup_start.elapsed());
        Ok(())
    }

    /// Start on already-connected backends.
    pub fn start_with(&mut self, backends: Backends) {
        let allocator = PatientCodeAllocator::new(
            &self.config,
            backends.store.clone(),
            backends.cache.clone(),
            &self.circuits,
        );
        let detector = DuplicateDetector::new(backends.directory.clone(), self.config.scoring.clone());

        info!(
            fast_path = allocator.fast_path_enabled(),
            namespace = %self.config.namespace,
            "Patient identifier engine ready"
        );
        self.allocator = Some(allocator);
        self.detector = Some(detector);
        self.backends = Some(backends);
        self.set_state(EngineState::Ready);
    }

    /// Stop accepting requests and drain background write-behinds.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating patient identifier engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        if let Some(ref allocator) = self.allocator {
            allocator.wait_idle().await;
        }

        self.set_state(EngineState::Stopped);
        info!(
            elapsed_ms = shutdown_start.elapsed().as_millis() as u64,
            "Patient identifier engine shutdown complete"
        );
    }
}
