//! Multi-tier read-through cache engine.
//!
//! A read goes local store, then other locations known to hold a fresher
//! copy, then the origin. Whatever wins is stored locally and announced to
//! the fleet so other processes can find it without hitting their origin.
//!
//! # Design
//!
//! - The local store and the external-miss registry are read together and
//!   retried if the store changed in between, so an entry evicted
//!   mid-read is never mistaken for a pointer to somewhere else.
//! - An external copy fresher than the local one (beyond the tolerance
//!   window) is preferred over a local hit.
//! - Spill writes, announcements and invalidation callbacks run as
//!   supervised background work; [`CacheEngine::shutdown`] waits for them.
//! - Concurrent reads of the same key are not deduplicated.
//!
//! # Example
//!
//! ```ignore
//! let engine = CacheEngine::builder(Arc::new(LocalCacheCompanion::new()))
//!     .options(CoreOptions::new().with_max_age(Expiration::from_secs(600)))
//!     .build()?;
//!
//! let user: User = engine.get(&("user", 42i64), || repo.load_user(42)).await?;
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashSet;
use serde_json::Value;
use tracing::Instrument;

use cachet_core::{
    codec, minus_expiration, truncate_to_seconds, CacheError, CacheKey, CacheMissDescriptor, CacheMode,
    CacheResult, CancelSignal, Clock, ConfigError, CoreOptions, DynamicOptions, DynamicOptionsProvider,
    Expiration, InvalidationDescriptor, InvalidationRule, KeyService, Keyable, LocationId, OperationOptions,
    StaticDynamicOptions, SystemClock,
};

use super::background::BackgroundTasks;
use super::entry::{CacheValue, ValueEntry};
use super::invalidation::{Invalidatable, InvalidationHandlers, InvalidationVerdict};
use super::latency::LatencyTracker;
use super::payload::KeyPayload;
use super::preload::Preloader;
use super::race::{race_first_valid, RaceOptions};
use super::read::{CacheRead, ReadSource};
use super::registry::{ExternalMissEntry, ExternalMissRegistry};
use super::store::{EntryOptions, EvictionReason, MemoryStore, Priority};
use super::traits::{CacheCompanion, CacheStats, LocationOutput, PassiveCacheLocation, ResolvedLocation};

/// Attempts at reading the store and registry from the same generation.
const SNAPSHOT_ATTEMPTS: usize = 8;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Per-call options for [`CacheEngine::get_with`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Per-call max-age, expiration overrides and the disable switch.
    pub operation: OperationOptions,
    /// Name used to look up dynamic overrides.
    pub caller: Option<String>,
    /// Aborts the read, including any running location race, when fired.
    pub cancel: Option<CancelSignal>,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: OperationOptions) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// A value found in the local store, in its serialized form.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    pub value_type: String,
    pub value: Value,
    pub creation_date: DateTime<Utc>,
}

/// Builder for [`CacheEngine`].
pub struct CacheEngineBuilder {
    companion: Arc<dyn CacheCompanion>,
    options: CoreOptions,
    dynamic: Arc<dyn DynamicOptionsProvider>,
    clock: Arc<dyn Clock>,
    keys: KeyService,
    handlers: InvalidationHandlers,
}

impl CacheEngineBuilder {
    pub fn options(mut self, options: CoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dynamic_options(mut self, provider: Arc<dyn DynamicOptionsProvider>) -> Self {
        self.dynamic = provider;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key_service(mut self, keys: KeyService) -> Self {
        self.keys = keys;
        self
    }

    /// Decide invalidation for keys tagged `tag`.
    pub fn invalidatable(mut self, tag: impl Into<String>, handler: impl Invalidatable + 'static) -> Self {
        self.handlers.register(tag, Arc::new(handler));
        self
    }

    /// Decide invalidation for keys no tag handler claims.
    pub fn invalidatable_fallback(mut self, handler: impl Invalidatable + 'static) -> Self {
        self.handlers.register_catch_all(Arc::new(handler));
        self
    }

    /// Validate the options and build the engine.
    pub fn build(self) -> Result<CacheEngine, ConfigError> {
        self.options.validate()?;

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let listener_ref = weak.clone();
            let store = MemoryStore::new(self.options.size_limit).with_listener(Arc::new(
                move |key: CacheKey, record: LocalRecord, reason: EvictionReason| {
                    if let Some(inner) = listener_ref.upgrade() {
                        inner.on_evicted(key, record, reason);
                    }
                },
            ));

            EngineInner {
                self_id: self.companion.self_location_id().clone(),
                companion: self.companion,
                options: self.options,
                dynamic: self.dynamic,
                clock: self.clock,
                keys: self.keys,
                handlers: self.handlers,
                store,
                live_keys: DashSet::new(),
                external: ExternalMissRegistry::new(),
                latencies: LatencyTracker::new(),
                background: BackgroundTasks::new(),
                downgrade_warned: AtomicBool::new(false),
                counters: Counters::default(),
            }
        });

        tracing::info!(
            location = %inner.self_id,
            mode = %inner.options.mode,
            size_limit = inner.options.size_limit,
            "Cache engine started"
        );

        Ok(CacheEngine { inner })
    }
}

/// Shared handle to one process's cache.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("location", &self.inner.self_id)
            .field("mode", &self.inner.options.mode)
            .field("store", &self.inner.store)
            .field("external_misses", &self.inner.external.len())
            .finish()
    }
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

#[derive(Clone)]
struct LocalRecord {
    entry: ValueEntry,
    expiration: Expiration,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    location_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct EngineInner {
    self_id: LocationId,
    companion: Arc<dyn CacheCompanion>,
    options: CoreOptions,
    dynamic: Arc<dyn DynamicOptionsProvider>,
    clock: Arc<dyn Clock>,
    keys: KeyService,
    handlers: InvalidationHandlers,
    store: MemoryStore<CacheKey, LocalRecord>,
    live_keys: DashSet<CacheKey>,
    external: ExternalMissRegistry,
    latencies: LatencyTracker,
    background: BackgroundTasks,
    downgrade_warned: AtomicBool,
    counters: Counters,
}

/// Resolved read parameters for one call.
struct ReadPlan {
    dynamic: DynamicOptions,
    now: DateTime<Utc>,
    minimum_creation_date: DateTime<Utc>,
    force_fetch: bool,
}

// ============================================================================
// PUBLIC API
// ============================================================================

impl CacheEngine {
    pub fn builder(companion: Arc<dyn CacheCompanion>) -> CacheEngineBuilder {
        CacheEngineBuilder {
            companion,
            options: CoreOptions::default(),
            dynamic: Arc::new(StaticDynamicOptions::new()),
            clock: Arc::new(SystemClock),
            keys: KeyService::new(),
            handlers: InvalidationHandlers::new(),
        }
    }

    pub fn self_location_id(&self) -> &LocationId {
        &self.inner.self_id
    }

    pub fn options(&self) -> &CoreOptions {
        &self.inner.options
    }

    pub fn key_service(&self) -> &KeyService {
        &self.inner.keys
    }

    pub fn companion(&self) -> &Arc<dyn CacheCompanion> {
        &self.inner.companion
    }

    /// Canonical key for `key`. `None` when the argument has no stable key:
    /// nothing canonicalizes it, or the result contains an address-based
    /// identity. Such reads bypass the cache.
    pub fn key_of(&self, key: &dyn Keyable) -> Option<CacheKey> {
        self.inner.keys.to_key(key).filter(|k| !k.is_process_local())
    }

    /// Read `key`, fetching from `fetch` when no acceptable copy exists.
    pub async fn get<T, F, Fut, E>(&self, key: &dyn Keyable, fetch: F) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.get_read(key, fetch, GetOptions::default()).await.map(CacheRead::into_value)
    }

    pub async fn get_with<T, F, Fut, E>(&self, key: &dyn Keyable, fetch: F, options: GetOptions) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.get_read(key, fetch, options).await.map(CacheRead::into_value)
    }

    /// Like [`get_with`](Self::get_with), also reporting where the value
    /// came from and when it was created.
    pub async fn get_read<T, F, Fut, E>(
        &self,
        key: &dyn Keyable,
        fetch: F,
        options: GetOptions,
    ) -> CacheResult<CacheRead<T>>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = self.key_of(key);
        let cancel = options.cancel.clone().unwrap_or_else(CancelSignal::never);
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let span = match &key {
            Some(key) => tracing::debug_span!("cache.get", key = %key),
            None => tracing::debug_span!("cache.get", key = "<unkeyed>"),
        };
        let work = self
            .inner
            .get_core(key, fetch, &options.operation, options.caller.as_deref(), &cancel)
            .instrument(span);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = work => result,
        }
    }

    /// Peek at the local store without fetching. Used by peers serving
    /// this process's copy.
    pub fn try_get_direct_from_memory(&self, key: &CacheKey) -> Option<MemoryHit> {
        let record = self.inner.store.get(key)?;
        match record.entry.to_json() {
            Ok(value) => Some(MemoryHit {
                value_type: record.entry.value_type().to_string(),
                value,
                creation_date: record.entry.creation_date(),
            }),
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Cannot serialize local entry");
                None
            }
        }
    }

    /// Apply `rule` locally and broadcast it. Returns how many entries were
    /// dropped.
    pub fn invalidate(&self, rule: &InvalidationRule) -> usize {
        self.inner.invalidate(rule, true)
    }

    /// Apply a rule received from another process.
    pub fn invalidate_descriptor(&self, descriptor: &InvalidationDescriptor) -> usize {
        if descriptor.emitter == self.inner.self_id {
            return 0;
        }
        self.inner.invalidate(&descriptor.rule, false)
    }

    /// Record that another location holds `descriptor.key`.
    pub fn add_external_miss(&self, descriptor: &CacheMissDescriptor) {
        self.inner.add_external_miss(descriptor);
    }

    /// The external-miss record for `key`, if any.
    pub fn external_miss(&self, key: &CacheKey) -> Option<ExternalMissEntry> {
        self.inner.external.get(key)
    }

    pub fn contains_local(&self, key: &CacheKey) -> bool {
        self.inner.live_keys.contains(key)
    }

    /// Drop expired local entries now.
    pub fn sweep(&self) -> usize {
        self.inner.store.sweep()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            location_hits: c.location_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            entry_count: self.inner.store.len() as u64,
            memory_bytes: self.inner.store.total_size(),
            evictions: c.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn preloader(&self) -> Preloader {
        Preloader::new(self.clone())
    }

    /// Wait for all background spill, announce and callback work.
    pub async fn shutdown(&self) {
        self.inner.background.drain().await;
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        truncate_to_seconds(self.inner.clock.now())
    }

    pub(crate) fn background(&self) -> &BackgroundTasks {
        &self.inner.background
    }
}

// ============================================================================
// READ PATH
// ============================================================================

impl EngineInner {
    fn plan(&self, operation: &OperationOptions, caller: Option<&str>) -> ReadPlan {
        let dynamic = self.dynamic.options_for(caller);
        let max_age = match dynamic.max_age {
            Some(forced) if dynamic.force_dynamic_max_age => forced,
            _ => Expiration::choose(dynamic.max_age, operation.max_age, self.options.max_age),
        };

        let now = truncate_to_seconds(self.clock.now());
        let mut minimum_creation_date = minus_expiration(now, max_age);
        if let Some(floor) = dynamic.minimum_creation_date {
            minimum_creation_date = minimum_creation_date.max(floor);
        }
        let force_fetch = max_age.is_zero() || minimum_creation_date >= now;

        ReadPlan {
            dynamic,
            now,
            minimum_creation_date,
            force_fetch,
        }
    }

    async fn get_core<T, F, Fut, E>(
        self: &Arc<Self>,
        key: Option<CacheKey>,
        fetch: F,
        operation: &OperationOptions,
        caller: Option<&str>,
        cancel: &CancelSignal,
    ) -> CacheResult<CacheRead<T>>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = match key {
            Some(key) if !operation.disabled => key,
            unkeyed => {
                if unkeyed.is_none() {
                    tracing::debug!("Argument has no stable cache key, bypassing the cache");
                }
                let value = fetch().await.map_err(CacheError::origin)?;
                let now = truncate_to_seconds(self.clock.now());
                return Ok(CacheRead::new(value, now, ReadSource::Disabled));
            }
        };

        let plan = self.plan(operation, caller);
        let value_type = self.keys.names().name_of::<T>();

        if !plan.force_fetch {
            let (local, external) = self.snapshot(&key);
            let local_creation = local
                .as_ref()
                .map(|e| e.creation_date())
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            match external {
                Some(ext) if self.external_is_newer(&ext, local_creation) => {
                    if ext.timestamp >= plan.minimum_creation_date {
                        if let Some(read) = self.race_locations::<T>(&key, ext, &plan, operation, cancel).await {
                            return Ok(read);
                        }
                    } else {
                        tracing::debug!(key = %key, "External copy too old, fetching from origin");
                    }
                }
                _ => {
                    if let Some(entry) = local.filter(|e| e.creation_date() >= plan.minimum_creation_date) {
                        match entry.data_as::<T>(&value_type) {
                            Ok(value) => {
                                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(key = %key, "Cache hit");
                                return Ok(CacheRead::new(value, entry.creation_date(), ReadSource::Memory));
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, key = %key, "Local entry unreadable, refetching");
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(key = %key, forced = plan.force_fetch, "Cache miss, fetching from origin");
        let value = fetch().await.map_err(CacheError::origin)?;
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let entry = ValueEntry::typed(value.clone(), value_type, plan.now);
        self.set_value(key, entry, &plan.dynamic, operation, false);
        Ok(CacheRead::new(value, plan.now, ReadSource::Origin))
    }

    /// Read the local entry and external record from one store generation.
    fn snapshot(&self, key: &CacheKey) -> (Option<ValueEntry>, Option<ExternalMissEntry>) {
        let read = || (self.store.get(key).map(|r| r.entry), self.external.get(key));
        read_consistent(|| self.store.generation(), read, SNAPSHOT_ATTEMPTS).unwrap_or_else(|| {
            tracing::debug!(key = %key, "Store kept changing during snapshot");
            read()
        })
    }

    fn external_is_newer(&self, ext: &ExternalMissEntry, local_creation: DateTime<Utc>) -> bool {
        let tolerance = ChronoDuration::from_std(self.options.local_entry_tolerance).unwrap_or(ChronoDuration::zero());
        let threshold = ext
            .timestamp
            .checked_sub_signed(tolerance)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        threshold > local_creation
    }

    /// Race the locations listed for `key`, fastest known first.
    async fn race_locations<T: CacheValue>(
        self: &Arc<Self>,
        key: &CacheKey,
        ext: ExternalMissEntry,
        plan: &ReadPlan,
        operation: &OperationOptions,
        cancel: &CancelSignal,
    ) -> Option<CacheRead<T>> {
        let ranked = self.latencies.rank(&ext.locations);

        let mut resolved: HashMap<LocationId, ResolvedLocation> = HashMap::new();
        for active in self.companion.get_active_locations(&ranked).await {
            resolved.insert(active.id().clone(), ResolvedLocation::Active(active));
        }
        for passive in self.companion.passive_locations() {
            resolved.insert(passive.id().clone(), ResolvedLocation::Passive(passive));
        }

        let candidates: Vec<(LocationId, Option<ResolvedLocation>)> = ranked
            .into_iter()
            .map(|id| {
                let location = resolved.get(&id).cloned();
                (id, location)
            })
            .collect();

        let payload = KeyPayload::new(key.clone());
        let invalid: DashSet<LocationId> = DashSet::new();
        let minimum_creation_date = plan.minimum_creation_date;

        let suppliers: Vec<_> = candidates
            .iter()
            .map(|(id, location)| {
                let (payload, invalid, latencies) = (&payload, &invalid, &self.latencies);
                move || async move {
                    let Some(location) = location else {
                        return Ok::<_, Infallible>(None);
                    };
                    let mark_invalid = || {
                        invalid.insert(id.clone());
                    };
                    let output = location.get(payload, minimum_creation_date, &mark_invalid, cancel).await;
                    if let Some(out) = &output {
                        latencies.record(id, out.latency_ms, out.serialized_size);
                    }
                    Ok(output.map(|out| (id.clone(), out)))
                }
            })
            .collect();

        let options = RaceOptions::new(self.options.location_prefetch_count, self.options.location_max_parallelism)
            .with_attempt_timeout(self.options.location_attempt_timeout);
        let outcome = race_first_valid(suppliers, options, |r: &Option<(LocationId, LocationOutput)>| r.is_some()).await;

        let pruned: Vec<LocationId> = invalid.iter().map(|id| id.key().clone()).collect();
        for id in &pruned {
            if resolved.get(id).is_some_and(ResolvedLocation::is_active) {
                self.latencies.forget(id);
            }
        }
        if !pruned.is_empty() {
            tracing::debug!(key = %key, pruned = pruned.len(), "Pruned invalid locations");
            self.external.remove_sub(key, &pruned);
        }

        let (winner, output) = match outcome {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Location race found nothing");
                return None;
            }
        };

        let value: T = match codec::from_bytes(&output.payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, location = %winner, "Undecodable location payload");
                return None;
            }
        };

        tracing::debug!(key = %key, location = %winner, latency_ms = output.latency_ms, "Served from location");
        self.counters.location_hits.fetch_add(1, Ordering::Relaxed);

        let value_type = self.keys.names().name_of::<T>();
        let entry = ValueEntry::typed(value.clone(), value_type, ext.timestamp);
        self.set_value(key.clone(), entry, &plan.dynamic, operation, false);
        Some(CacheRead::new(value, ext.timestamp, ReadSource::Location(winner)))
    }
}

// ============================================================================
// WRITE PATH
// ============================================================================

enum Announcement {
    /// Announce, inlining the value when it is small.
    Ping { threshold: i64 },
    /// Inline small values, spill the rest to passive locations.
    PingOrSpill { threshold: i64 },
    /// Spill to passive locations only.
    Spill,
}

impl EngineInner {
    fn set_value(
        self: &Arc<Self>,
        key: CacheKey,
        entry: ValueEntry,
        dynamic: &DynamicOptions,
        operation: &OperationOptions,
        skip_notify: bool,
    ) {
        self.live_keys.insert(key.clone());
        self.remove_external_miss(&key);

        let absolute = Expiration::choose(
            dynamic.absolute_expiration,
            operation.absolute_expiration,
            self.options.absolute_expiration,
        );
        let sliding = Expiration::choose(
            dynamic.sliding_expiration,
            operation.sliding_expiration,
            self.options.sliding_expiration,
        )
        .min(absolute);
        let mode = self.effective_mode(dynamic.mode.unwrap_or(self.options.mode));

        let size = key_size(&key).saturating_add(entry.size_heuristic());
        let priority = if size >= self.options.low_priority_size_threshold {
            Priority::Low
        } else if size >= self.options.mid_priority_size_threshold {
            Priority::Normal
        } else {
            Priority::High
        };

        let record = LocalRecord {
            entry: entry.clone(),
            expiration: absolute,
        };
        self.store.insert(
            key.clone(),
            record,
            EntryOptions {
                absolute_expiration: absolute.as_duration(),
                sliding_expiration: sliding.as_duration(),
                size,
                priority,
            },
        );

        // Address-based keys mean nothing to other processes.
        if skip_notify || key.is_process_local() {
            return;
        }

        let threshold = dynamic
            .miss_value_size_threshold
            .unwrap_or(self.options.miss_value_size_threshold);
        let announcement = match mode {
            CacheMode::InMemory => Announcement::Ping { threshold },
            CacheMode::MixedPassive => Announcement::PingOrSpill { threshold },
            CacheMode::PurePassive => Announcement::Spill,
        };
        self.announce(key, entry, absolute, announcement);
    }

    fn effective_mode(&self, mode: CacheMode) -> CacheMode {
        if mode == CacheMode::InMemory || !self.companion.passive_locations().is_empty() {
            return mode;
        }
        if !self.downgrade_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                requested = %mode,
                "No passive cache locations configured, falling back to in-memory mode"
            );
        }
        CacheMode::InMemory
    }

    fn announce(self: &Arc<Self>, key: CacheKey, entry: ValueEntry, expiration: Expiration, how: Announcement) {
        let inner = Arc::clone(self);
        self.background.spawn("cache.announce", async move {
            match how {
                Announcement::Ping { threshold } => {
                    let inline = inline_value(&entry, threshold);
                    inner
                        .notify_miss(&key, entry.creation_date(), inner.self_id.clone(), inline)
                        .await;
                }
                Announcement::PingOrSpill { threshold } => match inline_value(&entry, threshold) {
                    Some(inline) => {
                        inner
                            .notify_miss(&key, entry.creation_date(), inner.self_id.clone(), Some(inline))
                            .await;
                    }
                    None => inner.spill(&key, &entry, expiration),
                },
                Announcement::Spill => inner.spill(&key, &entry, expiration),
            }
        });
    }

    fn on_evicted(self: &Arc<Self>, key: CacheKey, record: LocalRecord, reason: EvictionReason) {
        if reason == EvictionReason::Replaced {
            return;
        }
        self.live_keys.remove(&key);

        if reason == EvictionReason::Capacity {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            if key.is_process_local() {
                return;
            }
            tracing::debug!(key = %key, "Evicted for capacity, spilling to passive locations");
            self.spill(&key, &record.entry, record.expiration);
        }
    }

    /// Write `entry` to every passive location in the background.
    fn spill(self: &Arc<Self>, key: &CacheKey, entry: &ValueEntry, expiration: Expiration) {
        for passive in self.companion.passive_locations() {
            let inner = Arc::clone(self);
            let (key, entry) = (key.clone(), entry.clone());
            self.background.spawn("cache.spill", async move {
                inner.write_to_location(key, entry, expiration, passive).await;
            });
        }
    }

    async fn write_to_location(
        &self,
        key: CacheKey,
        entry: ValueEntry,
        expiration: Expiration,
        passive: Arc<dyn PassiveCacheLocation>,
    ) {
        let stored = match entry.to_stored() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Cannot serialize entry for passive location");
                return;
            }
        };

        let payload = KeyPayload::new(key.clone());
        if !passive.try_write(&payload, &stored, expiration).await {
            tracing::debug!(key = %key, location = %passive.id(), "Passive location refused write");
            return;
        }

        let location = passive.id().clone();
        self.external.add(key.clone(), entry.creation_date(), location.clone());
        self.notify_miss(&key, entry.creation_date(), location, None).await;
    }

    async fn notify_miss(
        &self,
        key: &CacheKey,
        timestamp: DateTime<Utc>,
        location: LocationId,
        inline: Option<(String, Value)>,
    ) {
        let notifiers = self.companion.get_all_event_notifiers().await;
        if notifiers.is_empty() {
            return;
        }

        let mut descriptor = CacheMissDescriptor::new(self.self_id.clone(), key.clone(), timestamp, location);
        if let Some((value_type, value)) = inline {
            descriptor = descriptor.with_value(value_type, value);
        }

        let descriptor = Arc::new(descriptor);
        for notifier in notifiers {
            let descriptor = Arc::clone(&descriptor);
            self.background.spawn("cache.notify_miss", async move {
                if let Err(e) = notifier.notify_cache_miss(&descriptor).await {
                    tracing::warn!(error = %e, key = %descriptor.key, "Failed to announce cache miss");
                }
            });
        }
    }

    /// Forget where else `key` lives and delete passive copies of it.
    fn remove_external_miss(&self, key: &CacheKey) {
        let Some(locations) = self.external.remove(key) else {
            return;
        };

        for passive in self.companion.passive_locations() {
            if !locations.contains(passive.id()) {
                continue;
            }
            let payload = KeyPayload::new(key.clone());
            self.background.spawn("cache.passive_delete", async move {
                passive.delete(&payload).await;
            });
        }
    }

    fn add_external_miss(self: &Arc<Self>, descriptor: &CacheMissDescriptor) {
        if descriptor.emitter == self.self_id {
            return;
        }
        if descriptor.key.is_process_local() {
            tracing::debug!(emitter = %descriptor.emitter, "Ignoring miss for a process-local key");
            return;
        }

        match descriptor.inlined() {
            Some((value_type, value)) => {
                let entry = ValueEntry::serialized(value_type, value.clone(), descriptor.timestamp);
                self.set_value(
                    descriptor.key.clone(),
                    entry,
                    &DynamicOptions::default(),
                    &OperationOptions::default(),
                    true,
                );
            }
            None => {
                self.external.add(
                    descriptor.key.clone(),
                    descriptor.timestamp,
                    descriptor.source_location.clone(),
                );
            }
        }
    }
}

// ============================================================================
// INVALIDATION
// ============================================================================

impl EngineInner {
    fn invalidate(self: &Arc<Self>, rule: &InvalidationRule, broadcast: bool) -> usize {
        let mut callbacks = Vec::new();
        let mut removed = 0usize;

        let live: Vec<CacheKey> = self.live_keys.iter().map(|k| k.key().clone()).collect();
        for key in live {
            if let InvalidationVerdict::Invalidated(callback) = self.handlers.check(&key, rule) {
                self.store.remove(&key);
                self.live_keys.remove(&key);
                removed += 1;
                callbacks.extend(callback);
            }
        }

        for key in self.external.keys() {
            if let InvalidationVerdict::Invalidated(callback) = self.handlers.check(&key, rule) {
                self.remove_external_miss(&key);
                removed += 1;
                callbacks.extend(callback);
            }
        }

        tracing::debug!(kind = %rule.kind, removed, broadcast, "Applied invalidation rule");

        if broadcast {
            let inner = Arc::clone(self);
            let descriptor = InvalidationDescriptor::new(self.self_id.clone(), rule.clone());
            self.background.spawn("cache.notify_invalidation", async move {
                let descriptor = Arc::new(descriptor);
                for notifier in inner.companion.get_all_event_notifiers().await {
                    let descriptor = Arc::clone(&descriptor);
                    inner.background.spawn("cache.notify_invalidation", async move {
                        if let Err(e) = notifier.notify_invalidation(&descriptor).await {
                            tracing::warn!(error = %e, "Failed to broadcast invalidation");
                        }
                    });
                }
            });
        }

        if !callbacks.is_empty() {
            self.background.spawn("cache.invalidation_callbacks", async move {
                for callback in callbacks {
                    callback.await;
                }
            });
        }

        removed
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn key_size(key: &CacheKey) -> u64 {
    match codec::to_value(key) {
        Ok(json) => codec::size_heuristic(&json),
        Err(e) => {
            tracing::warn!(error = %e, "Error calculating key size");
            u64::MAX
        }
    }
}

/// Run `read` until `generation` is the same before and after it.
fn read_consistent<R>(generation: impl Fn() -> u64, mut read: impl FnMut() -> R, attempts: usize) -> Option<R> {
    for _ in 0..attempts {
        let before = generation();
        let result = read();
        if generation() == before {
            return Some(result);
        }
    }
    None
}

fn inline_value(entry: &ValueEntry, threshold: i64) -> Option<(String, Value)> {
    if !entry.is_small(threshold) {
        return None;
    }
    entry.to_json().ok().map(|json| (entry.value_type().to_string(), json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::companion::LocalCacheCompanion;
    use cachet_core::{cancel_pair, DynamicOptions, InvalidationReason, StaticDynamicOptions};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("origin down")]
    struct OriginDown;

    fn engine(options: CoreOptions) -> CacheEngine {
        CacheEngine::builder(Arc::new(LocalCacheCompanion::new()))
            .options(options)
            .build()
            .unwrap()
    }

    async fn counted(counter: &AtomicUsize, value: &str) -> Result<String, OriginDown> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(value.to_string())
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_memory() {
        let engine = engine(CoreOptions::new().with_max_age(Expiration::from_secs(600)));
        let calls = AtomicUsize::new(0);

        let first: String = engine.get(&"K", || counted(&calls, "a")).await.unwrap();
        let second: String = engine.get(&"K", || counted(&calls, "b")).await.unwrap();

        assert_eq!(first, "a");
        assert_eq!(second, "a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = engine.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_zero_max_age_always_fetches() {
        let engine = engine(CoreOptions::new());
        let calls = AtomicUsize::new(0);
        let options = || GetOptions::new().with_operation(OperationOptions::new().with_max_age(Expiration::ZERO));

        for _ in 0..3 {
            let _: String = engine.get_with(&"K", || counted(&calls, "v"), options()).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disabled_bypasses_store() {
        let engine = engine(CoreOptions::new());
        let calls = AtomicUsize::new(0);
        let options = GetOptions::new().with_operation(OperationOptions::disabled());

        let read: CacheRead<String> = engine.get_read(&"K", || counted(&calls, "v"), options).await.unwrap();
        assert_eq!(read.source(), &ReadSource::Disabled);
        assert!(!engine.contains_local(&CacheKey::from("K")));
    }

    #[tokio::test]
    async fn test_origin_failure_propagates_and_is_not_cached() {
        let engine = engine(CoreOptions::new());
        let result: CacheResult<String> = engine.get(&"K", || async { Err(OriginDown) }).await;
        assert!(result.unwrap_err().is_origin_failure());
        assert!(!engine.contains_local(&CacheKey::from("K")));
    }

    #[tokio::test]
    async fn test_cancel_aborts_origin_fetch() {
        let engine = engine(CoreOptions::new());
        let (handle, signal) = cancel_pair();

        let read = engine.get_with(
            &"K",
            || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<String, OriginDown>("late".to_string())
            },
            GetOptions::new().with_cancel(signal),
        );
        handle.cancel();
        let result: CacheResult<String> = read.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_forced_dynamic_max_age_wins() {
        let dynamic = StaticDynamicOptions::new().with_caller(
            "reports",
            DynamicOptions::new().with_forced_max_age(Expiration::ZERO),
        );
        let engine = CacheEngine::builder(Arc::new(LocalCacheCompanion::new()))
            .options(CoreOptions::new().with_max_age(Expiration::Never))
            .dynamic_options(Arc::new(dynamic))
            .build()
            .unwrap();
        let calls = AtomicUsize::new(0);

        let options = || {
            GetOptions::new()
                .with_caller("reports")
                .with_operation(OperationOptions::new().with_max_age(Expiration::from_secs(600)))
        };
        let _: String = engine.get_with(&"K", || counted(&calls, "v"), options()).await.unwrap();
        let _: String = engine.get_with(&"K", || counted(&calls, "v"), options()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_drops_matching_keys_once() {
        let engine = CacheEngine::builder(Arc::new(LocalCacheCompanion::new()))
            .invalidatable("user", |key: &CacheKey, rule: &InvalidationRule| {
                InvalidationVerdict::from_bool(
                    rule.is_kind("user") && key.payload() == Some(&CacheKey::from(rule.payload["id"].as_i64().unwrap_or(-1))),
                )
            })
            .build()
            .unwrap();
        let calls = AtomicUsize::new(0);

        for id in [1i64, 2] {
            let key = CacheKey::tagged("user", CacheKey::from(id));
            let _: String = engine.get(&key, || counted(&calls, "v")).await.unwrap();
        }

        let rule = InvalidationRule::new(InvalidationReason::Updated, "user", json!({ "id": 1 }));
        assert_eq!(engine.invalidate(&rule), 1);
        assert_eq!(engine.invalidate(&rule), 0);
        assert!(!engine.contains_local(&CacheKey::tagged("user", CacheKey::from(1i64))));
        assert!(engine.contains_local(&CacheKey::tagged("user", CacheKey::from(2i64))));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_emitted_descriptors_are_ignored() {
        let engine = engine(CoreOptions::new());
        let me = engine.self_location_id().clone();

        let miss = CacheMissDescriptor::new(me.clone(), CacheKey::from("K"), Utc::now(), me.clone())
            .with_value("String", json!("v"));
        engine.add_external_miss(&miss);
        assert!(!engine.contains_local(&CacheKey::from("K")));
        assert!(engine.external_miss(&CacheKey::from("K")).is_none());

        let rule = InvalidationRule::new(InvalidationReason::Manual, "all", json!(null));
        assert_eq!(engine.invalidate_descriptor(&InvalidationDescriptor::new(me, rule)), 0);
    }

    #[tokio::test]
    async fn test_inlined_miss_is_stored_without_fetch() {
        let engine = engine(CoreOptions::new());
        let value_type = engine.key_service().names().name_of::<String>();
        let created = truncate_to_seconds(Utc::now());

        let miss = CacheMissDescriptor::new("peer".into(), CacheKey::from("K"), created, "peer".into())
            .with_value(value_type, json!("from-peer"));
        engine.add_external_miss(&miss);

        let read: CacheRead<String> = engine
            .get_read(&"K", || async { Err::<String, _>(OriginDown) }, GetOptions::new())
            .await
            .unwrap();
        assert_eq!(read.value(), "from-peer");
        assert_eq!(read.created_at(), created);
        assert_eq!(read.source(), &ReadSource::Memory);
    }

    #[tokio::test]
    async fn test_miss_without_value_is_registered() {
        let engine = engine(CoreOptions::new());
        let ts = truncate_to_seconds(Utc::now());
        let miss = CacheMissDescriptor::new("peer".into(), CacheKey::from("K"), ts, "peer".into());
        engine.add_external_miss(&miss);

        let entry = engine.external_miss(&CacheKey::from("K")).unwrap();
        assert_eq!(entry.timestamp, ts);
        assert_eq!(entry.locations, vec![LocationId::from("peer")]);
    }

    #[tokio::test]
    async fn test_mode_downgrade_without_passives() {
        let engine = engine(CoreOptions::new().with_mode(CacheMode::PurePassive));
        assert_eq!(engine.inner.effective_mode(CacheMode::PurePassive), CacheMode::InMemory);
        assert_eq!(engine.inner.effective_mode(CacheMode::MixedPassive), CacheMode::InMemory);
        assert!(engine.inner.downgrade_warned.load(Ordering::Relaxed));
    }

    #[derive(Default)]
    struct RecordingNotifier {
        misses: std::sync::Mutex<Vec<CacheKey>>,
    }

    #[async_trait::async_trait]
    impl crate::cache::traits::CacheEventNotifier for RecordingNotifier {
        async fn notify_cache_miss(
            &self,
            descriptor: &CacheMissDescriptor,
        ) -> Result<(), crate::cache::traits::LocationError> {
            self.misses.lock().unwrap().push(descriptor.key.clone());
            Ok(())
        }

        async fn notify_invalidation(
            &self,
            _descriptor: &InvalidationDescriptor,
        ) -> Result<(), crate::cache::traits::LocationError> {
            Ok(())
        }
    }

    struct NotifyingCompanion {
        self_id: LocationId,
        notifier: Arc<RecordingNotifier>,
    }

    #[async_trait::async_trait]
    impl CacheCompanion for NotifyingCompanion {
        fn self_location_id(&self) -> &LocationId {
            &self.self_id
        }

        fn passive_locations(&self) -> Vec<Arc<dyn PassiveCacheLocation>> {
            Vec::new()
        }

        async fn get_active_locations(
            &self,
            _ids: &[LocationId],
        ) -> Vec<Arc<dyn crate::cache::traits::ActiveCacheLocation>> {
            Vec::new()
        }

        async fn get_all_event_notifiers(&self) -> Vec<Arc<dyn crate::cache::traits::CacheEventNotifier>> {
            vec![self.notifier.clone()]
        }
    }

    struct Opaque(#[allow(dead_code)] u32);

    impl Keyable for Opaque {}

    #[tokio::test]
    async fn test_unkeyable_arguments_bypass_the_store() {
        let engine = engine(CoreOptions::new());
        let calls = AtomicUsize::new(0);

        for n in 0..10u32 {
            let key = Box::new(Opaque(n));
            let expected = format!("v{n}");
            let read: CacheRead<String> = engine
                .get_read(&*key, || counted(&calls, &expected), GetOptions::new())
                .await
                .unwrap();
            assert_eq!(read.value(), &expected);
            assert_eq!(read.source(), &ReadSource::Disabled);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(engine.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_process_local_keys_are_never_announced() {
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = CacheEngine::builder(Arc::new(NotifyingCompanion {
            self_id: "proc-0".into(),
            notifier: notifier.clone(),
        }))
        .build()
        .unwrap();
        let now = engine.now();

        let local = CacheKey::array([CacheKey::from("report"), CacheKey::Identity(0xdead)]);
        let shared = CacheKey::from("report");
        for key in [local.clone(), shared.clone()] {
            let entry = ValueEntry::typed("v".to_string(), "String", now);
            engine.inner.set_value(
                key,
                entry,
                &DynamicOptions::default(),
                &OperationOptions::default(),
                false,
            );
        }
        engine.shutdown().await;

        assert_eq!(notifier.misses.lock().unwrap().as_slice(), &[shared]);
        assert!(engine.contains_local(&local));

        let from_peer = CacheMissDescriptor::new("peer".into(), CacheKey::Identity(0xbeef), now, "peer".into())
            .with_value("String", json!("v"));
        engine.add_external_miss(&from_peer);
        assert!(!engine.contains_local(&CacheKey::Identity(0xbeef)));
    }

    #[test]
    fn test_read_consistent_retries_until_generation_is_stable() {
        let generation = AtomicU64::new(0);
        let mut reads = 0;
        let result = read_consistent(
            || generation.load(Ordering::SeqCst),
            || {
                reads += 1;
                // The first two reads race with a removal.
                if reads <= 2 {
                    generation.fetch_add(1, Ordering::SeqCst);
                }
                reads
            },
            SNAPSHOT_ATTEMPTS,
        );
        assert_eq!(result, Some(3));
        assert_eq!(reads, 3);
    }

    #[test]
    fn test_read_consistent_gives_up_after_attempts() {
        let generation = AtomicU64::new(0);
        let mut reads = 0;
        let result = read_consistent(
            || generation.load(Ordering::SeqCst),
            || {
                reads += 1;
                generation.fetch_add(1, Ordering::SeqCst);
            },
            SNAPSHOT_ATTEMPTS,
        );
        assert_eq!(result, None);
        assert_eq!(reads, SNAPSHOT_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_rereads_after_lazy_expiry() {
        let engine = engine(CoreOptions::new().with_absolute_expiration(Expiration::from_secs(10)));
        let key = CacheKey::from("K");
        let calls = AtomicUsize::new(0);
        let _: String = engine.get(&"K", || counted(&calls, "v")).await.unwrap();
        let ts = engine.now();
        engine.add_external_miss(&CacheMissDescriptor::new("peer".into(), key.clone(), ts, "peer".into()));

        tokio::time::advance(Duration::from_secs(11)).await;
        let before = engine.inner.store.generation();
        let (local, external) = engine.inner.snapshot(&key);

        assert!(local.is_none());
        assert_eq!(external.map(|e| e.locations), Some(vec![LocationId::from("peer")]));
        assert!(engine.inner.store.generation() > before);
        assert!(!engine.contains_local(&key));
    }

    #[test]
    fn test_build_rejects_invalid_options() {
        let result = CacheEngine::builder(Arc::new(LocalCacheCompanion::new()))
            .options(CoreOptions::new().with_location_prefetch_count(1).with_location_max_parallelism(3))
            .build();
        assert!(result.is_err());
    }
}
