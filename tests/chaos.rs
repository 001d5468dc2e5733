//! Chaos Testing for the Patient Code Allocator
//!
//! This module tests failure scenarios using:
//! 1. **Failing wrappers** - cache/table outages switched on and off mid-run
//! 2. **Slow backends** - a cache that answers after the fast-path budget
//! 3. **Data loss and corruption** - flushed or garbage cache state
//! 4. **Container killing** - Redis death under a live engine (Docker)
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos
//! cargo test --test chaos -- --ignored --nocapture   # Docker scenarios
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tempfile::TempDir;

use patient_id_engine::{
    AllocatedCode, AllocationError, AllocationPath, BackendCircuits, InMemoryCache,
    PatientCodeAllocator, PatientIdConfig, PatientIdEngine, PeriodKey, SequenceCache,
    SequenceState, SequenceStore, SqlStore, StorageError,
};

use testcontainers::{clients::Cli, Container, GenericImage, core::WaitFor};

// =============================================================================
// Failing Wrappers - Switchable Outages
// =============================================================================

/// A cache that can be taken down or slowed down while tests run.
pub struct ChaosCache {
    inner: InMemoryCache,
    down: AtomicBool,
    delay_ms: AtomicU64,
    calls: AtomicU64,
}

impl ChaosCache {
    pub fn new() -> Self {
        Self {
            inner: InMemoryCache::new(),
            down: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryCache {
        &self.inner
    }

    async fn gate(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("Connection refused (injected)".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SequenceCache for ChaosCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.gate().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        self.gate().await?;
        self.inner.compare_and_set(key, expected, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.gate().await?;
        self.inner.try_lock(key, token, ttl).await
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError> {
        self.gate().await?;
        self.inner.unlock(key, token).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.gate().await
    }
}

/// A sequence table that can be taken down, or made slow to record, while
/// tests run.
pub struct ChaosStore {
    inner: Arc<SqlStore>,
    down: AtomicBool,
    record_delay_ms: AtomicU64,
    failed_records: AtomicU64,
}

impl ChaosStore {
    pub fn new(inner: Arc<SqlStore>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            record_delay_ms: AtomicU64::new(0),
            failed_records: AtomicU64::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_record_delay(&self, delay: Duration) {
        self.record_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn failed_records(&self) -> u64 {
        self.failed_records.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), StorageError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("Lost connection to MySQL server (injected)".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for ChaosStore {
    async fn load(&self, period: &PeriodKey) -> Result<Option<SequenceState>, StorageError> {
        self.gate()?;
        self.inner.load(period).await
    }

    async fn allocate(
        &self,
        period: &PeriodKey,
        floor: Option<SequenceState>,
    ) -> Result<SequenceState, StorageError> {
        self.gate()?;
        self.inner.allocate(period, floor).await
    }

    async fn record(&self, period: &PeriodKey, state: &SequenceState) -> Result<bool, StorageError> {
        let delay = self.record_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Err(e) = self.gate() {
            self.failed_records.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }
        self.inner.record(period, state).await
    }

    async fn list_periods(&self, tenant: &str) -> Result<Vec<(i32, SequenceState)>, StorageError> {
        self.gate()?;
        self.inner.list_periods(tenant).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.gate()?;
        self.inner.ping().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct Rig {
    _dir: TempDir,
    cache: Arc<ChaosCache>,
    store: Arc<ChaosStore>,
    circuits: BackendCircuits,
    allocator: PatientCodeAllocator,
}

async fn rig(config: PatientIdConfig) -> Rig {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("chaos.db").display());
    let sql = Arc::new(SqlStore::new(&url).await.unwrap());
    let cache = Arc::new(ChaosCache::new());
    let store = Arc::new(ChaosStore::new(sql));
    let circuits = BackendCircuits::new();
    let allocator = PatientCodeAllocator::new(
        &config,
        store.clone(),
        Some(cache.clone() as Arc<dyn SequenceCache>),
        &circuits,
    );
    Rig { _dir: dir, cache, store, circuits, allocator }
}

fn ordinal(code: &AllocatedCode) -> u64 {
    code.ordinal()
}

async fn issue(allocator: &PatientCodeAllocator, n: usize) -> Vec<(AllocatedCode, AllocationPath)> {
    let mut issued = Vec::with_capacity(n);
    for _ in 0..n {
        let allocation = allocator.allocate("CENTREA", 2025).await.unwrap();
        issued.push((allocation.code, allocation.path));
    }
    issued
}

fn assert_contiguous(codes: &[AllocatedCode], first: u64) {
    for (i, code) in codes.iter().enumerate() {
        assert_eq!(ordinal(code), first + i as u64, "gap or repeat at {}", code);
    }
}

// =============================================================================
// Scenarios (no Docker)
// =============================================================================

#[tokio::test]
async fn chaos_cache_down_from_start_serves_durably_and_trips_circuit() {
    let rig = rig(PatientIdConfig::default()).await;
    rig.cache.set_down(true);

    let issued = issue(&rig.allocator, 20).await;
    assert!(issued.iter().all(|(_, path)| *path == AllocationPath::Durable));

    let codes: Vec<_> = issued.into_iter().map(|(c, _)| c).collect();
    assert_contiguous(&codes, 1);
    assert_eq!(codes[0].to_string(), "CENTREA-2025-001-AAA");

    assert!(rig.circuits.cache.failures() > 0);
    assert!(rig.circuits.cache.rejections() > 0, "cache circuit should open under a hard outage");
}

#[tokio::test]
async fn chaos_cache_recovers_and_catches_up_with_table() {
    let rig = rig(PatientIdConfig::default()).await;

    let mut codes: Vec<_> = issue(&rig.allocator, 5).await.into_iter().map(|(c, _)| c).collect();
    rig.allocator.wait_idle().await;

    rig.cache.set_down(true);
    codes.extend(issue(&rig.allocator, 5).await.into_iter().map(|(c, _)| c));

    rig.cache.set_down(false);
    codes.extend(issue(&rig.allocator, 5).await.into_iter().map(|(c, _)| c));
    rig.allocator.wait_idle().await;

    assert_contiguous(&codes, 1);

    let usage = rig.allocator.sequence_usage("CENTREA", 2025).await.unwrap();
    assert_eq!(usage.last_code.unwrap().to_string(), "CENTREA-2025-015-AAA");

    let period = PeriodKey::new("CENTREA", 2025).unwrap();
    let cached = rig.cache.inner().get(&period.state_key("hms")).await.unwrap().unwrap();
    assert_eq!(SequenceState::decode(&cached).unwrap().last_number, 15);
}

#[tokio::test]
async fn chaos_slow_cache_times_out_to_durable() {
    let config = PatientIdConfig {
        fast_path_timeout_ms: 50,
        ..Default::default()
    };
    let rig = rig(config).await;

    let mut codes: Vec<_> = issue(&rig.allocator, 3).await.into_iter().map(|(c, _)| c).collect();
    rig.allocator.wait_idle().await;

    rig.cache.set_delay(Duration::from_millis(200));
    let slow = issue(&rig.allocator, 3).await;
    assert!(slow.iter().all(|(_, path)| *path == AllocationPath::Durable));
    codes.extend(slow.into_iter().map(|(c, _)| c));

    rig.cache.set_delay(Duration::ZERO);
    codes.extend(issue(&rig.allocator, 3).await.into_iter().map(|(c, _)| c));

    assert_contiguous(&codes, 1);
}

#[tokio::test]
async fn chaos_cache_flushed_after_write_behind_drains() {
    let rig = rig(PatientIdConfig::default()).await;

    let first = issue(&rig.allocator, 10).await;
    assert_eq!(first[0].1, AllocationPath::Durable, "cold start goes through the table");
    assert!(first[1..].iter().all(|(_, path)| *path == AllocationPath::Fast));
    rig.allocator.wait_idle().await;

    rig.cache.inner().clear();

    let second = issue(&rig.allocator, 10).await;
    assert_eq!(second[0].1, AllocationPath::Durable);

    let codes: Vec<_> = first.into_iter().chain(second).map(|(c, _)| c).collect();
    assert_contiguous(&codes, 1);
}

#[tokio::test]
async fn chaos_corrupted_cache_value_is_replaced() {
    let rig = rig(PatientIdConfig::default()).await;
    issue(&rig.allocator, 3).await;
    rig.allocator.wait_idle().await;

    let key = PeriodKey::new("CENTREA", 2025).unwrap().state_key("hms");
    rig.cache.inner().set(&key, "{not a sequence}", Duration::from_secs(60)).await.unwrap();

    let repaired = rig.allocator.allocate("CENTREA", 2025).await.unwrap();
    assert_eq!(repaired.path, AllocationPath::Durable);
    assert_eq!(repaired.code.to_string(), "CENTREA-2025-004-AAA");

    let next = rig.allocator.allocate("CENTREA", 2025).await.unwrap();
    assert_eq!(next.path, AllocationPath::Fast);
    assert_eq!(next.code.to_string(), "CENTREA-2025-005-AAA");
}

#[tokio::test]
async fn chaos_table_down_warm_cache_keeps_serving() {
    let rig = rig(PatientIdConfig::default()).await;
    issue(&rig.allocator, 2).await;
    rig.allocator.wait_idle().await;

    rig.store.set_down(true);
    let during = issue(&rig.allocator, 5).await;
    assert!(during.iter().all(|(_, path)| *path == AllocationPath::Fast));
    rig.allocator.wait_idle().await;
    assert!(rig.store.failed_records() > 0, "write-behinds should have hit the outage");

    rig.store.set_down(false);
    let after = rig.allocator.allocate("CENTREA", 2025).await.unwrap();
    rig.allocator.wait_idle().await;
    assert_eq!(after.code.to_string(), "CENTREA-2025-008-AAA");

    // The table catches up with the next successful write-behind.
    let usage = rig.allocator.sequence_usage("CENTREA", 2025).await.unwrap();
    assert_eq!(usage.last_code.unwrap().to_string(), "CENTREA-2025-008-AAA");
}

#[tokio::test]
async fn chaos_cache_lost_while_write_behinds_lag() {
    let rig = rig(PatientIdConfig::default()).await;
    rig.store.set_record_delay(Duration::from_millis(300));

    let before: Vec<_> = issue(&rig.allocator, 4).await.into_iter().map(|(c, _)| c).collect();
    assert_contiguous(&before, 1);

    // The table is still at 001 while 002-004 are in flight
    rig.cache.set_down(true);
    let during = rig.allocator.allocate("CENTREA", 2025).await.unwrap();
    assert_eq!(during.path, AllocationPath::Durable);
    assert_eq!(during.code.to_string(), "CENTREA-2025-005-AAA");

    rig.cache.set_down(false);
    rig.allocator.wait_idle().await;
    let after = rig.allocator.allocate("CENTREA", 2025).await.unwrap();
    assert_eq!(after.code.to_string(), "CENTREA-2025-006-AAA");
}

#[tokio::test]
async fn chaos_both_backends_down_surfaces_unavailable() {
    let rig = rig(PatientIdConfig::default()).await;
    rig.cache.set_down(true);
    rig.store.set_down(true);

    let err = rig.allocator.generate_code_for_year("CENTREA", 2025).await.unwrap_err();
    assert!(matches!(err, AllocationError::BackendUnavailable(_)), "got {:?}", err);

    rig.store.set_down(false);
    let code = rig.allocator.generate_code_for_year("CENTREA", 2025).await.unwrap();
    assert_eq!(code.to_string(), "CENTREA-2025-001-AAA", "failed attempts must not consume codes");
}

#[tokio::test]
async fn chaos_concurrent_allocators_during_cache_outage() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("shared.db").display());
    let sql = Arc::new(SqlStore::new(&url).await.unwrap());
    let cache = Arc::new(ChaosCache::new());
    cache.set_down(true);

    let config = PatientIdConfig::default();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let circuits = BackendCircuits::new();
        let allocator = Arc::new(PatientCodeAllocator::new(
            &config,
            sql.clone(),
            Some(cache.clone() as Arc<dyn SequenceCache>),
            &circuits,
        ));
        for _ in 0..20 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator.generate_code_for_year("CENTREA", 2025).await.unwrap()
            }));
        }
    }

    let mut seen = HashSet::new();
    for handle in handles {
        assert!(seen.insert(handle.await.unwrap().to_string()), "duplicate code issued");
    }
    assert_eq!(seen.len(), 60);
    assert!(cache.calls() > 0);
}

// =============================================================================
// Container Helpers
// =============================================================================

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

// =============================================================================
// Scenarios (Docker)
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn chaos_redis_killed_mid_run() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let redis_port = redis.get_host_port_ipv4(6379);
    let dir = TempDir::new().unwrap();

    let config = PatientIdConfig {
        redis_url: Some(format!("redis://127.0.0.1:{}", redis_port)),
        sql_url: Some(format!("sqlite://{}?mode=rwc", dir.path().join("kill.db").display())),
        fast_path_timeout_ms: 200,
        ..Default::default()
    };

    let mut engine = PatientIdEngine::new(config);
    engine.start().await.expect("Failed to start");
    assert!(engine.health_check().await.fast_path_enabled);

    let mut codes = Vec::new();
    for _ in 0..10 {
        codes.push(engine.generate_code_for_year("CENTREA", 2025).await.unwrap());
    }
    engine.wait_idle().await;

    println!("Killing Redis...");
    drop(redis);
    tokio::time::sleep(Duration::from_millis(200)).await;

    for _ in 0..10 {
        codes.push(engine.generate_code_for_year("CENTREA", 2025).await.unwrap());
    }
    assert_contiguous(&codes, 1);

    let health = engine.health_check().await;
    assert_eq!(health.cache_connected, Some(false));
    assert!(health.healthy, "the table alone keeps the engine healthy");

    engine.shutdown().await;
}
