//! Collaborator traits for cache locations, fleet membership and broadcast.
//!
//! Transports implement these; the engine only ever talks to the traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use cachet_core::{
    CacheMissDescriptor, CancelSignal, Expiration, InvalidationDescriptor, LocationId, StoredEntry,
};

use super::payload::KeyPayload;

/// Transport-level failure reported by a location or notifier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("Location {location} unreachable: {reason}")]
    Unreachable { location: String, reason: String },

    #[error("Location {location} rejected the request: {reason}")]
    Rejected { location: String, reason: String },
}

/// A value served by a location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationOutput {
    /// Encoded value.
    pub payload: Vec<u8>,
    /// Size of the value as transferred, in bytes.
    pub serialized_size: u64,
    /// Round-trip time of the lookup.
    pub latency_ms: f64,
}

/// Whether a location is a live peer or a durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationKind {
    Active,
    Passive,
}

/// Anything that may hold a cached copy.
#[async_trait]
pub trait CacheLocation: Send + Sync + fmt::Debug {
    fn id(&self) -> &LocationId;

    fn kind(&self) -> LocationKind;

    /// Look up `key`. Returns `None` on miss or failure; calls `mark_invalid`
    /// when this location should no longer be listed for the key.
    async fn get(
        &self,
        key: &KeyPayload,
        minimum_creation_date: DateTime<Utc>,
        mark_invalid: &(dyn Fn() + Send + Sync),
        cancel: &CancelSignal,
    ) -> Option<LocationOutput>;
}

/// A peer process queried live.
pub trait ActiveCacheLocation: CacheLocation {}

/// A durable store shared by the fleet.
#[async_trait]
pub trait PassiveCacheLocation: CacheLocation {
    /// Persist `entry`. Returns whether the write happened.
    async fn try_write(&self, key: &KeyPayload, entry: &StoredEntry, expiration: Expiration) -> bool;

    async fn delete(&self, key: &KeyPayload);
}

/// Fleet broadcast channel. Delivery is best-effort.
#[async_trait]
pub trait CacheEventNotifier: Send + Sync {
    async fn notify_cache_miss(&self, descriptor: &CacheMissDescriptor) -> Result<(), LocationError>;

    async fn notify_invalidation(&self, descriptor: &InvalidationDescriptor) -> Result<(), LocationError>;
}

/// Resolves fleet membership and builds per-peer handles.
#[async_trait]
pub trait CacheCompanion: Send + Sync {
    fn self_location_id(&self) -> &LocationId;

    fn passive_locations(&self) -> Vec<Arc<dyn PassiveCacheLocation>>;

    /// Handles for the currently reachable peers among `ids`.
    async fn get_active_locations(&self, ids: &[LocationId]) -> Vec<Arc<dyn ActiveCacheLocation>>;

    async fn get_all_event_notifiers(&self) -> Vec<Arc<dyn CacheEventNotifier>>;
}

/// A race candidate resolved to its transport handle.
#[derive(Clone)]
pub(crate) enum ResolvedLocation {
    Active(Arc<dyn ActiveCacheLocation>),
    Passive(Arc<dyn PassiveCacheLocation>),
}

impl ResolvedLocation {
    pub(crate) fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub(crate) async fn get(
        &self,
        key: &KeyPayload,
        minimum_creation_date: DateTime<Utc>,
        mark_invalid: &(dyn Fn() + Send + Sync),
        cancel: &CancelSignal,
    ) -> Option<LocationOutput> {
        match self {
            Self::Active(l) => l.get(key, minimum_creation_date, mark_invalid, cancel).await,
            Self::Passive(l) => l.get(key, minimum_creation_date, mark_invalid, cancel).await,
        }
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Reads served from the local store.
    pub hits: u64,
    /// Reads served from another location.
    pub location_hits: u64,
    /// Reads that went to the origin.
    pub misses: u64,
    /// Number of entries currently in the local store.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of reads not served by the origin (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.location_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 60,
            location_hits: 20,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_location_error_display() {
        let err = LocationError::Unreachable {
            location: "p2".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "Location p2 unreachable: connection refused");
    }
}
