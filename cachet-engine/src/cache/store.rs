//! Local in-memory store.
//!
//! A sharded map of records with absolute and sliding expiration, size
//! accounting and priority-ordered capacity eviction.
//!
//! # Design
//!
//! - Total size lives in one atomic counter.
//! - Expiry is checked lazily on read and eagerly by [`MemoryStore::sweep`].
//! - Over the limit, compaction evicts `Low` before `Normal` before `High`,
//!   least recently accessed first within a tier. The entry whose insert
//!   triggered compaction goes last.
//! - Every removal bumps a generation counter so readers can detect that the
//!   store changed under them.
//! - The eviction listener is called after the shard lock is released.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Why a record left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// Overwritten by a newer insert for the same key.
    Replaced,
    /// Removed explicitly.
    Removed,
    /// Absolute or sliding expiration elapsed.
    Expired,
    /// Evicted to get back under the size limit.
    Capacity,
}

/// Eviction order class; lower goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Per-insert options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    pub absolute_expiration: Option<Duration>,
    pub sliding_expiration: Option<Duration>,
    pub size: u64,
    pub priority: Priority,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            absolute_expiration: None,
            sliding_expiration: None,
            size: 1,
            priority: Priority::Normal,
        }
    }
}

pub type EvictionListener<K, V> = Arc<dyn Fn(K, V, EvictionReason) + Send + Sync>;

struct Record<V> {
    value: V,
    size: u64,
    priority: Priority,
    absolute_deadline: Option<Instant>,
    sliding: Option<Duration>,
    sliding_deadline: Option<Instant>,
    last_access: u64,
}

impl<V> Record<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.absolute_deadline.is_some_and(|d| now >= d) || self.sliding_deadline.is_some_and(|d| now >= d)
    }

    fn touch(&mut self, now: Instant, tick: u64) {
        self.last_access = tick;
        if let Some(sliding) = self.sliding {
            let next = now + sliding;
            // Sliding never outlives the absolute deadline.
            self.sliding_deadline = Some(match self.absolute_deadline {
                Some(abs) if abs < next => abs,
                _ => next,
            });
        }
    }
}

/// Concurrent size-bounded store.
pub struct MemoryStore<K, V> {
    records: DashMap<K, Record<V>>,
    size_limit: u64,
    total_size: AtomicU64,
    generation: AtomicU64,
    clock: AtomicU64,
    listener: Option<EvictionListener<K, V>>,
}

impl<K, V> fmt::Debug for MemoryStore<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.records.len())
            .field("size_limit", &self.size_limit)
            .field("total_size", &self.total_size.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(size_limit: u64) -> Self {
        Self {
            records: DashMap::new(),
            size_limit,
            total_size: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: EvictionListener<K, V>) -> Self {
        self.listener = Some(listener);
        self
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn notify(&self, key: K, value: V, reason: EvictionReason) {
        if let Some(listener) = &self.listener {
            listener(key, value, reason);
        }
    }

    fn account_removal(&self, size: u64) {
        self.total_size.fetch_sub(size, Ordering::AcqRel);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Insert or replace `key`. May trigger capacity eviction.
    pub fn insert(&self, key: K, value: V, options: EntryOptions) {
        let now = Instant::now();
        let absolute_deadline = options.absolute_expiration.map(|d| now + d);
        // Anything above the limit is evicted right away; clamping keeps the
        // counter from wrapping on unmeasurable sizes.
        let size = options.size.min(self.size_limit.saturating_add(1));
        let mut record = Record {
            value,
            size,
            priority: options.priority,
            absolute_deadline,
            sliding: options.sliding_expiration,
            sliding_deadline: None,
            last_access: 0,
        };
        record.touch(now, self.tick());

        self.total_size.fetch_add(size, Ordering::AcqRel);
        if let Some(previous) = self.records.insert(key.clone(), record) {
            self.account_removal(previous.size);
            self.notify(key.clone(), previous.value, EvictionReason::Replaced);
        }

        if self.total_size.load(Ordering::Acquire) > self.size_limit {
            self.compact(&key);
        }
    }

    /// Read `key`, refreshing its sliding window. Expired records are
    /// removed on the way.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let mut record = self.records.get_mut(key)?;
            if !record.is_expired(now) {
                let tick = self.tick();
                record.touch(now, tick);
                return Some(record.value.clone());
            }
        }

        self.remove_with(key, EvictionReason::Expired, |r| r.is_expired(now));
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.records.contains_key(key)
    }

    /// Remove `key` explicitly.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.remove_with(key, EvictionReason::Removed, |_| true)
    }

    fn remove_with<F>(&self, key: &K, reason: EvictionReason, predicate: F) -> Option<V>
    where
        F: FnOnce(&Record<V>) -> bool,
    {
        let (k, record) = self.records.remove_if(key, |_, r| predicate(r))?;
        self.account_removal(record.size);
        let value = record.value.clone();
        self.notify(k, record.value, reason);
        Some(value)
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .records
            .iter()
            .filter(|r| r.value().is_expired(now))
            .map(|r| r.key().clone())
            .collect();

        expired
            .iter()
            .filter(|k| self.remove_with(k, EvictionReason::Expired, |r| r.is_expired(now)).is_some())
            .count()
    }

    fn compact(&self, protected: &K) {
        let mut candidates: Vec<(Priority, u64, K)> = self
            .records
            .iter()
            .filter(|r| r.key() != protected)
            .map(|r| (r.value().priority, r.value().last_access, r.key().clone()))
            .collect();
        candidates.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, key) in candidates {
            if self.total_size.load(Ordering::Acquire) <= self.size_limit {
                return;
            }
            self.remove_with(&key, EvictionReason::Capacity, |_| true);
        }

        if self.total_size.load(Ordering::Acquire) > self.size_limit {
            self.remove_with(protected, EvictionReason::Capacity, |_| true);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Counter bumped on every removal.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn keys(&self) -> Vec<K> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<(String, u32, EvictionReason)>>>;

    fn recording_store(limit: u64) -> (MemoryStore<String, u32>, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let store = MemoryStore::new(limit).with_listener(Arc::new(move |k, v, r| {
            sink.lock().unwrap().push((k, v, r));
        }));
        (store, events)
    }

    fn sized(size: u64, priority: Priority) -> EntryOptions {
        EntryOptions {
            size,
            priority,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let (store, events) = recording_store(100);
        store.insert("a".to_string(), 1, EntryOptions::default());
        assert_eq!(store.get(&"a".to_string()), Some(1));
        assert_eq!(store.total_size(), 1);

        assert_eq!(store.remove(&"a".to_string()), Some(1));
        assert_eq!(store.get(&"a".to_string()), None);
        assert_eq!(store.total_size(), 0);
        assert_eq!(events.lock().unwrap().as_slice(), &[("a".to_string(), 1, EvictionReason::Removed)]);
    }

    #[tokio::test]
    async fn test_replace_reports_replaced_and_fixes_size() {
        let (store, events) = recording_store(100);
        store.insert("a".to_string(), 1, sized(10, Priority::Normal));
        store.insert("a".to_string(), 2, sized(4, Priority::Normal));
        assert_eq!(store.total_size(), 4);
        assert_eq!(store.get(&"a".to_string()), Some(2));
        assert_eq!(events.lock().unwrap()[0].2, EvictionReason::Replaced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_expiration() {
        let (store, events) = recording_store(100);
        store.insert(
            "a".to_string(),
            1,
            EntryOptions {
                absolute_expiration: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        );
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get(&"a".to_string()), Some(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get(&"a".to_string()), None);
        assert_eq!(events.lock().unwrap()[0].2, EvictionReason::Expired);
        assert_eq!(store.total_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_refresh_is_capped_by_absolute() {
        let (store, _) = recording_store(100);
        store.insert(
            "a".to_string(),
            1,
            EntryOptions {
                absolute_expiration: Some(Duration::from_secs(10)),
                sliding_expiration: Some(Duration::from_secs(4)),
                ..Default::default()
            },
        );
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(3)).await;
            assert_eq!(store.get(&"a".to_string()), Some(1));
        }
        // t = 9: sliding alone would run to 13, absolute ends it at 10.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get(&"a".to_string()), Some(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get(&"a".to_string()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_expires_when_idle() {
        let (store, _) = recording_store(100);
        store.insert(
            "a".to_string(),
            1,
            EntryOptions {
                sliding_expiration: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        );
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_low_priority_first() {
        let (store, events) = recording_store(30);
        store.insert("high".to_string(), 1, sized(10, Priority::High));
        store.insert("low".to_string(), 2, sized(10, Priority::Low));
        store.insert("normal".to_string(), 3, sized(10, Priority::Normal));
        store.insert("new".to_string(), 4, sized(10, Priority::High));

        assert_eq!(store.total_size(), 30);
        assert!(!store.contains_key(&"low".to_string()));
        assert!(store.contains_key(&"high".to_string()));
        assert!(store.contains_key(&"new".to_string()));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ("low".to_string(), 2, EvictionReason::Capacity));
    }

    #[tokio::test]
    async fn test_capacity_prefers_least_recently_used_within_tier() {
        let (store, _) = recording_store(20);
        store.insert("a".to_string(), 1, sized(10, Priority::Normal));
        store.insert("b".to_string(), 2, sized(10, Priority::Normal));
        store.get(&"a".to_string());
        store.insert("c".to_string(), 3, sized(10, Priority::Normal));

        assert!(store.contains_key(&"a".to_string()));
        assert!(!store.contains_key(&"b".to_string()));
        assert!(store.contains_key(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_oversized_entry_is_evicted_itself() {
        let (store, events) = recording_store(10);
        store.insert("big".to_string(), 1, sized(50, Priority::High));
        assert!(store.is_empty());
        assert_eq!(store.total_size(), 0);
        assert_eq!(events.lock().unwrap()[0].2, EvictionReason::Capacity);
    }

    #[tokio::test]
    async fn test_generation_moves_on_removal() {
        let (store, _) = recording_store(100);
        let g0 = store.generation();
        store.insert("a".to_string(), 1, EntryOptions::default());
        assert_eq!(store.generation(), g0);
        store.remove(&"a".to_string());
        assert!(store.generation() > g0);
    }
}
