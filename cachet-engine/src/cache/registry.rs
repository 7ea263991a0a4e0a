//! Registry of entries known to live in other processes or passive stores.

use cachet_core::{CacheKey, LocationId, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Where a key was last seen outside this process, and when it was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMissEntry {
    pub timestamp: Timestamp,
    pub locations: Vec<LocationId>,
}

impl ExternalMissEntry {
    pub fn new(timestamp: Timestamp, location: LocationId) -> Self {
        Self {
            timestamp,
            locations: vec![location],
        }
    }
}

/// Key to newest known external copy.
///
/// Updates are merged atomically per key: a newer timestamp replaces the
/// entry, an equal one adds the location, an older one is ignored.
#[derive(Debug, Default)]
pub struct ExternalMissRegistry {
    entries: DashMap<CacheKey, ExternalMissEntry>,
}

impl ExternalMissRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: CacheKey, timestamp: Timestamp, location: LocationId) {
        match self.entries.entry(key) {
            Entry::Vacant(v) => {
                v.insert(ExternalMissEntry::new(timestamp, location));
            }
            Entry::Occupied(mut o) => {
                let existing = o.get_mut();
                if timestamp > existing.timestamp {
                    *existing = ExternalMissEntry::new(timestamp, location);
                } else if timestamp == existing.timestamp && !existing.locations.contains(&location) {
                    existing.locations.push(location);
                }
            }
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<ExternalMissEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Drop the whole entry, returning the locations it pointed at.
    pub fn remove(&self, key: &CacheKey) -> Option<Vec<LocationId>> {
        self.entries.remove(key).map(|(_, e)| e.locations)
    }

    /// Drop some locations from an entry; the entry goes once it is empty.
    pub fn remove_sub(&self, key: &CacheKey, locations: &[LocationId]) {
        if locations.is_empty() {
            return;
        }
        if let Entry::Occupied(mut o) = self.entries.entry(key.clone()) {
            o.get_mut().locations.retain(|l| !locations.contains(l));
            if o.get().locations.is_empty() {
                o.remove();
            }
        }
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
