//! Cache engine and its collaborators.
//!
//! - [`engine`]: the read-through engine
//! - [`store`]: local size-bounded store
//! - [`registry`]: where else keys are known to live
//! - [`race`]: bounded racing over locations
//! - [`traits`]: location, companion and notifier contracts

mod background;
mod companion;
mod engine;
mod entry;
mod invalidation;
mod latency;
mod payload;
mod preload;
mod race;
mod read;
mod registry;
mod store;
mod traits;

pub use background::{sweeper_task, BackgroundTasks};
pub use companion::LocalCacheCompanion;
pub use engine::{CacheEngine, CacheEngineBuilder, GetOptions, MemoryHit};
pub use entry::{CacheValue, ValueEntry};
pub use invalidation::{Invalidatable, InvalidationCallback, InvalidationHandlers, InvalidationVerdict};
pub use latency::LatencyTracker;
pub use payload::KeyPayload;
pub use preload::Preloader;
pub use race::{race_first_valid, RaceError, RaceOptions};
pub use read::{CacheRead, ReadSource};
pub use registry::{ExternalMissEntry, ExternalMissRegistry};
pub use store::{EntryOptions, EvictionListener, EvictionReason, MemoryStore, Priority};
pub use traits::{
    ActiveCacheLocation, CacheCompanion, CacheEventNotifier, CacheLocation, CacheStats, LocationError,
    LocationKind, LocationOutput, PassiveCacheLocation,
};
