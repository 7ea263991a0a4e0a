//! Cachet Test Utilities
//!
//! Shared test infrastructure for the cachet workspace:
//! - Mock passive store and peer locations
//! - Loopback notifier bus delivering to in-process engines
//! - Manual clock and companion fixtures
//! - An in-process fleet of engines wired together
//! - Proptest generators and custom assertions

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

pub use cachet_core::{
    codec, CacheKey, CacheMissDescriptor, CancelSignal, Clock, CoreOptions, Expiration, InvalidationDescriptor,
    InvalidationRule, LocationId, StoredEntry,
};
pub use cachet_engine::{
    ActiveCacheLocation, CacheCompanion, CacheEngine, CacheEventNotifier, CacheLocation, CacheRead, Invalidatable,
    InvalidationVerdict, KeyPayload, LocationError, LocationKind, LocationOutput, PassiveCacheLocation, ReadSource,
};

/// Install a fmt subscriber for test output. Safe to call from every test.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cachet=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// CLOCK
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// A clock at a fixed, whole-second instant.
    pub fn at_epoch_secs(secs: i64) -> Self {
        let start = Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now);
        Self::new(start)
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

// ============================================================================
// MOCK PASSIVE LOCATION
// ============================================================================

/// In-memory shared store standing in for a durable cache.
///
/// Reads older than the requested minimum creation date, and reads of
/// missing keys, mark the location invalid for that key.
#[derive(Debug)]
pub struct MockPassiveLocation {
    id: LocationId,
    entries: RwLock<HashMap<String, StoredEntry>>,
    latency_ms: f64,
    delay_ms: AtomicU64,
    refuse_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl MockPassiveLocation {
    pub fn new(id: impl Into<LocationId>) -> Self {
        Self {
            id: id.into(),
            entries: RwLock::new(HashMap::new()),
            latency_ms: 5.0,
            delay_ms: AtomicU64::new(0),
            refuse_writes: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Hold every read for `delay`. A cancelled caller gets `None` early.
    pub fn set_read_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_refuse_writes(&self, refuse: bool) {
        self.refuse_writes.store(refuse, Ordering::SeqCst);
    }

    /// Put an entry directly, bypassing the write counter.
    pub fn seed(&self, key: &CacheKey, entry: StoredEntry) {
        if let (Ok(k), Ok(mut entries)) = (KeyPayload::new(key.clone()).as_string(), self.entries.write()) {
            entries.insert(k, entry);
        }
    }

    pub fn stored(&self, key: &CacheKey) -> Option<StoredEntry> {
        let k = KeyPayload::new(key.clone()).as_string().ok()?;
        self.entries.read().ok()?.get(&k).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl CacheLocation for MockPassiveLocation {
    fn id(&self) -> &LocationId {
        &self.id
    }

    fn kind(&self) -> LocationKind {
        LocationKind::Passive
    }

    async fn get(
        &self,
        key: &KeyPayload,
        minimum_creation_date: DateTime<Utc>,
        mark_invalid: &(dyn Fn() + Send + Sync),
        cancel: &CancelSignal,
    ) -> Option<LocationOutput> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let k = key.as_string().ok()?;
        let entry = self.entries.read().ok()?.get(&k).cloned();

        let Some(entry) = entry else {
            mark_invalid();
            return None;
        };
        if entry.creation_date < minimum_creation_date {
            mark_invalid();
            self.remove(&k);
            return None;
        }

        let payload = codec::to_bytes(&entry.data).ok()?;
        Some(LocationOutput {
            serialized_size: payload.len() as u64,
            payload,
            latency_ms: self.latency_ms,
        })
    }
}

#[async_trait]
impl PassiveCacheLocation for MockPassiveLocation {
    async fn try_write(&self, key: &KeyPayload, entry: &StoredEntry, _expiration: Expiration) -> bool {
        if self.refuse_writes.load(Ordering::SeqCst) {
            return false;
        }
        let Ok(k) = key.as_string() else {
            return false;
        };
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        entries.insert(k, entry.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn delete(&self, key: &KeyPayload) {
        if let Ok(k) = key.as_string() {
            self.remove(&k);
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// FLEET DIRECTORY AND PEERS
// ============================================================================

/// Engines of an in-process fleet, addressable by location id.
#[derive(Debug, Default)]
pub struct FleetDirectory {
    engines: RwLock<HashMap<LocationId, CacheEngine>>,
    unreachable: RwLock<HashSet<LocationId>>,
}

impl FleetDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, engine: CacheEngine) {
        if let Ok(mut engines) = self.engines.write() {
            engines.insert(engine.self_location_id().clone(), engine);
        }
    }

    pub fn engine(&self, id: &LocationId) -> Option<CacheEngine> {
        self.engines.read().ok()?.get(id).cloned()
    }

    pub fn engines(&self) -> Vec<CacheEngine> {
        self.engines
            .read()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &LocationId) -> bool {
        self.engines.read().map(|e| e.contains_key(id)).unwrap_or(false)
    }

    pub fn set_reachable(&self, id: &LocationId, reachable: bool) {
        if let Ok(mut unreachable) = self.unreachable.write() {
            if reachable {
                unreachable.remove(id);
            } else {
                unreachable.insert(id.clone());
            }
        }
    }

    pub fn is_reachable(&self, id: &LocationId) -> bool {
        self.unreachable.read().map(|u| !u.contains(id)).unwrap_or(true)
    }

    /// Drop every engine, breaking the companion/directory reference cycle.
    pub fn clear(&self) {
        if let Ok(mut engines) = self.engines.write() {
            engines.clear();
        }
    }
}

/// Active location backed by another in-process engine.
#[derive(Debug)]
pub struct PeerLocation {
    id: LocationId,
    directory: Arc<FleetDirectory>,
    latency_ms: f64,
}

impl PeerLocation {
    pub fn new(id: LocationId, directory: Arc<FleetDirectory>) -> Self {
        Self {
            id,
            directory,
            latency_ms: 1.0,
        }
    }
}

#[async_trait]
impl CacheLocation for PeerLocation {
    fn id(&self) -> &LocationId {
        &self.id
    }

    fn kind(&self) -> LocationKind {
        LocationKind::Active
    }

    async fn get(
        &self,
        key: &KeyPayload,
        minimum_creation_date: DateTime<Utc>,
        mark_invalid: &(dyn Fn() + Send + Sync),
        _cancel: &CancelSignal,
    ) -> Option<LocationOutput> {
        let peer = self
            .directory
            .engine(&self.id)
            .filter(|_| self.directory.is_reachable(&self.id));
        let Some(peer) = peer else {
            tracing::debug!(location = %self.id, "Peer unreachable");
            mark_invalid();
            return None;
        };

        let hit = peer
            .try_get_direct_from_memory(key.key())
            .filter(|hit| hit.creation_date >= minimum_creation_date);
        let Some(hit) = hit else {
            mark_invalid();
            return None;
        };

        let payload = codec::to_bytes(&hit.value).ok()?;
        Some(LocationOutput {
            serialized_size: payload.len() as u64,
            payload,
            latency_ms: self.latency_ms,
        })
    }
}

impl ActiveCacheLocation for PeerLocation {}

// ============================================================================
// NOTIFIER BUS
// ============================================================================

/// Notifier delivering every broadcast to every engine in a directory.
///
/// Engines drop their own echoes, so the bus does not filter.
#[derive(Debug)]
pub struct LoopbackBus {
    directory: Arc<FleetDirectory>,
    misses: Mutex<Vec<CacheMissDescriptor>>,
    invalidations: Mutex<Vec<InvalidationDescriptor>>,
    down: AtomicBool,
}

impl LoopbackBus {
    pub fn new(directory: Arc<FleetDirectory>) -> Self {
        Self {
            directory,
            misses: Mutex::new(Vec::new()),
            invalidations: Mutex::new(Vec::new()),
            down: AtomicBool::new(false),
        }
    }

    /// Make every send fail.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn sent_misses(&self) -> Vec<CacheMissDescriptor> {
        self.misses.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn sent_invalidations(&self) -> Vec<InvalidationDescriptor> {
        self.invalidations.lock().map(|i| i.clone()).unwrap_or_default()
    }

    fn check_up(&self) -> Result<(), LocationError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LocationError::Unreachable {
                location: "loopback".to_string(),
                reason: "bus is down".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheEventNotifier for LoopbackBus {
    async fn notify_cache_miss(&self, descriptor: &CacheMissDescriptor) -> Result<(), LocationError> {
        self.check_up()?;
        if let Ok(mut misses) = self.misses.lock() {
            misses.push(descriptor.clone());
        }
        for engine in self.directory.engines() {
            engine.add_external_miss(descriptor);
        }
        Ok(())
    }

    async fn notify_invalidation(&self, descriptor: &InvalidationDescriptor) -> Result<(), LocationError> {
        self.check_up()?;
        if let Ok(mut invalidations) = self.invalidations.lock() {
            invalidations.push(descriptor.clone());
        }
        for engine in self.directory.engines() {
            engine.invalidate_descriptor(descriptor);
        }
        Ok(())
    }
}

// ============================================================================
// COMPANION
// ============================================================================

/// Companion with a fixed set of passive locations and notifiers.
/// Active locations are resolved through an optional fleet directory.
pub struct StaticCompanion {
    self_id: LocationId,
    passives: Vec<Arc<dyn PassiveCacheLocation>>,
    notifiers: Vec<Arc<dyn CacheEventNotifier>>,
    directory: Option<Arc<FleetDirectory>>,
}

impl StaticCompanion {
    pub fn new(self_id: impl Into<LocationId>) -> Self {
        Self {
            self_id: self_id.into(),
            passives: Vec::new(),
            notifiers: Vec::new(),
            directory: None,
        }
    }

    pub fn with_passive(mut self, passive: Arc<dyn PassiveCacheLocation>) -> Self {
        self.passives.push(passive);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CacheEventNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn with_directory(mut self, directory: Arc<FleetDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }
}

#[async_trait]
impl CacheCompanion for StaticCompanion {
    fn self_location_id(&self) -> &LocationId {
        &self.self_id
    }

    fn passive_locations(&self) -> Vec<Arc<dyn PassiveCacheLocation>> {
        self.passives.clone()
    }

    async fn get_active_locations(&self, ids: &[LocationId]) -> Vec<Arc<dyn ActiveCacheLocation>> {
        let Some(directory) = &self.directory else {
            return Vec::new();
        };
        ids.iter()
            .filter(|id| **id != self.self_id && directory.contains(id))
            .map(|id| Arc::new(PeerLocation::new(id.clone(), Arc::clone(directory))) as Arc<dyn ActiveCacheLocation>)
            .collect()
    }

    async fn get_all_event_notifiers(&self) -> Vec<Arc<dyn CacheEventNotifier>> {
        self.notifiers.clone()
    }
}

// ============================================================================
// FLEET
// ============================================================================

/// Several engines sharing a loopback bus and, optionally, one passive store.
pub struct Fleet {
    engines: Vec<CacheEngine>,
    directory: Arc<FleetDirectory>,
    bus: Arc<LoopbackBus>,
    passive: Option<Arc<MockPassiveLocation>>,
    clock: Arc<ManualClock>,
}

pub struct FleetBuilder {
    processes: usize,
    options: CoreOptions,
    passive: bool,
    start_secs: i64,
    handlers: Vec<(String, Arc<dyn Invalidatable>)>,
}

impl Default for FleetBuilder {
    fn default() -> Self {
        Self {
            processes: 2,
            options: CoreOptions::default(),
            passive: false,
            start_secs: 1_700_000_000,
            handlers: Vec::new(),
        }
    }
}

impl FleetBuilder {
    pub fn processes(mut self, n: usize) -> Self {
        self.processes = n;
        self
    }

    pub fn options(mut self, options: CoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_passive_store(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Register the same invalidation handler on every engine.
    pub fn invalidatable(mut self, tag: impl Into<String>, handler: impl Invalidatable + 'static) -> Self {
        self.handlers.push((tag.into(), Arc::new(handler)));
        self
    }

    pub fn build(self) -> Fleet {
        let directory = Arc::new(FleetDirectory::new());
        let bus = Arc::new(LoopbackBus::new(Arc::clone(&directory)));
        let clock = Arc::new(ManualClock::at_epoch_secs(self.start_secs));
        let passive = self.passive.then(|| Arc::new(MockPassiveLocation::new("passive-0")));

        let engines = (0..self.processes)
            .map(|i| {
                let mut companion = StaticCompanion::new(format!("proc-{i}"))
                    .with_directory(Arc::clone(&directory))
                    .with_notifier(bus.clone());
                if let Some(passive) = &passive {
                    companion = companion.with_passive(passive.clone());
                }

                let mut builder = CacheEngine::builder(Arc::new(companion))
                    .options(self.options.clone())
                    .clock(clock.clone());
                for (tag, handler) in &self.handlers {
                    let handler = Arc::clone(handler);
                    builder = builder.invalidatable(tag.clone(), move |key: &CacheKey, rule: &InvalidationRule| {
                        handler.check(key, rule)
                    });
                }
                let engine = builder
                    .build()
                    .unwrap_or_else(|e| panic!("invalid fleet options: {e}"));
                directory.register(engine.clone());
                engine
            })
            .collect();

        Fleet {
            engines,
            directory,
            bus,
            passive,
            clock,
        }
    }
}

impl Fleet {
    pub fn builder() -> FleetBuilder {
        FleetBuilder::default()
    }

    pub fn engine(&self, i: usize) -> &CacheEngine {
        &self.engines[i]
    }

    pub fn id(&self, i: usize) -> LocationId {
        self.engines[i].self_location_id().clone()
    }

    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    pub fn passive(&self) -> Option<&Arc<MockPassiveLocation>> {
        self.passive.as_ref()
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn set_reachable(&self, i: usize, reachable: bool) {
        self.directory.set_reachable(&self.id(i), reachable);
    }

    /// Drain background work on every engine until the fleet is quiet.
    /// Work on one engine can spawn work on another, hence several rounds.
    pub async fn settle(&self) {
        for _ in 0..3 {
            for engine in &self.engines {
                engine.shutdown().await;
            }
        }
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.directory.clear();
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_scalar_key() -> impl Strategy<Value = CacheKey> {
        prop_oneof![
            Just(CacheKey::Null),
            any::<bool>().prop_map(CacheKey::Bool),
            any::<i64>().prop_map(CacheKey::Int),
            "[a-z0-9]{0,12}".prop_map(CacheKey::Str),
            prop::collection::vec(any::<u8>(), 0..8).prop_map(CacheKey::Bytes),
        ]
    }

    /// Nested keys without process-local identities.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        arb_scalar_key().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(CacheKey::Array),
                ("[a-z]{1,6}", inner.clone()).prop_map(|(tag, payload)| CacheKey::tagged(tag, payload)),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..3).prop_map(CacheKey::Map),
            ]
        })
    }

    pub fn arb_expiration() -> impl Strategy<Value = Expiration> {
        prop_oneof![
            Just(Expiration::Never),
            (0u64..86_400).prop_map(Expiration::from_secs),
        ]
    }

    pub fn arb_location_id() -> impl Strategy<Value = LocationId> {
        "[a-z]{1,4}-[0-9]{1,3}".prop_map(LocationId::from)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions about where a read was served from.

    use super::*;

    #[track_caller]
    pub fn assert_from_memory<T: std::fmt::Debug>(read: &CacheRead<T>) {
        assert_eq!(read.source(), &ReadSource::Memory, "Expected memory hit, got {:?}", read);
    }

    #[track_caller]
    pub fn assert_from_origin<T: std::fmt::Debug>(read: &CacheRead<T>) {
        assert_eq!(read.source(), &ReadSource::Origin, "Expected origin fetch, got {:?}", read);
    }

    #[track_caller]
    pub fn assert_from_location<T: std::fmt::Debug>(read: &CacheRead<T>, location: &LocationId) {
        match read.source() {
            ReadSource::Location(id) => assert_eq!(id, location, "Served by the wrong location"),
            other => panic!("Expected read from {location}, got {other:?}"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::at_epoch_secs(1_000);
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now() - t0, chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_mock_passive_rejects_stale_entries() {
        let store = MockPassiveLocation::new("p");
        let key = CacheKey::from("k");
        let created = Utc.timestamp_opt(1_000, 0).single().unwrap();
        store.seed(
            &key,
            StoredEntry {
                value_type: "String".into(),
                data: serde_json::json!("v"),
                creation_date: created,
            },
        );

        let invalid = AtomicUsize::new(0);
        let mark = || {
            invalid.fetch_add(1, Ordering::SeqCst);
        };
        let payload = KeyPayload::new(key.clone());
        let never = CancelSignal::never();

        let fresh = store.get(&payload, created, &mark, &never).await;
        assert_eq!(fresh.map(|o| o.payload), Some(b"\"v\"".to_vec()));
        assert_eq!(invalid.load(Ordering::SeqCst), 0);

        let stale = store.get(&payload, created + chrono::Duration::seconds(1), &mark, &never).await;
        assert!(stale.is_none());
        assert_eq!(invalid.load(Ordering::SeqCst), 1);
        assert!(store.stored(&key).is_none());
    }
}
