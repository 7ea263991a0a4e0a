//! Cachet Engine - Multi-tier Read-Through Cache
//!
//! Serves reads from the local store, from other processes or shared
//! stores known to hold a fresher copy, or from the caller's origin, in
//! that order. Transports for peers, shared stores and fleet broadcast are
//! plugged in through the traits in [`cache`].

pub mod cache;

pub use cache::{
    race_first_valid, sweeper_task, ActiveCacheLocation, BackgroundTasks, CacheCompanion, CacheEngine,
    CacheEngineBuilder, CacheEventNotifier, CacheLocation, CacheRead, CacheStats, CacheValue, EntryOptions,
    EvictionReason, ExternalMissEntry, ExternalMissRegistry, GetOptions, Invalidatable, InvalidationCallback,
    InvalidationHandlers, InvalidationVerdict, KeyPayload, LatencyTracker, LocalCacheCompanion, LocationError,
    LocationKind, LocationOutput, MemoryHit, MemoryStore, PassiveCacheLocation, Preloader, Priority, RaceError,
    RaceOptions, ReadSource, ValueEntry,
};

pub use cachet_core::{
    cancel_pair, CacheError, CacheKey, CacheMissDescriptor, CacheMode, CacheResult, CancelSignal, CoreOptions, Expiration,
    InvalidationDescriptor, InvalidationReason, InvalidationRule, KeyService, Keyable, LocationId,
    OperationOptions, StoredEntry,
};
