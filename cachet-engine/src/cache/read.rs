//! Read results carrying provenance metadata.
//!
//! Plain `get` hands back the value; `get_read` wraps it in a [`CacheRead`]
//! so callers that care can see where the value came from and how old it is.

use chrono::{DateTime, Utc};
use std::time::Duration;

use cachet_core::LocationId;

/// Where a read was served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSource {
    /// The local store.
    Memory,
    /// A peer process or durable store.
    Location(LocationId),
    /// The origin fetch.
    Origin,
    /// Caching was disabled for the call.
    Disabled,
}

/// Result of a cache read, carrying creation-date and source metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    /// Creation date of the value, as agreed across the fleet.
    created_at: DateTime<Utc>,
    source: ReadSource,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, created_at: DateTime<Utc>, source: ReadSource) -> Self {
        Self {
            value,
            created_at,
            source,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn source(&self) -> &ReadSource {
        &self.source
    }

    /// Whether the value was served without calling the origin.
    pub fn was_cache_hit(&self) -> bool {
        matches!(self.source, ReadSource::Memory | ReadSource::Location(_))
    }

    /// Check if the value was created at or after the given timestamp.
    pub fn is_fresh_as_of(&self, timestamp: DateTime<Utc>) -> bool {
        self.created_at >= timestamp
    }

    /// Age of the value relative to `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            created_at: self.created_at,
            source: self.source,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
