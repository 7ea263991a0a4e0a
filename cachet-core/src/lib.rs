//! Cachet Core - Shared Types
//!
//! Data types shared by the cache engine and its collaborators: canonical
//! keys and the key canonicalizer, options, expirations, wire descriptors
//! and the serialization boundary. No engine logic lives here.

pub mod cancel;
pub mod clock;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod dynamic;
pub mod error;
pub mod expiration;
pub mod interchange;
pub mod key;
pub mod key_service;
pub mod location;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use clock::{minus_expiration, truncate_to_seconds, Clock, SystemClock};
pub use config::{CacheMode, CoreOptions, OperationOptions};
pub use descriptor::{
    CacheMissDescriptor, InvalidationDescriptor, InvalidationReason, InvalidationRule, StoredEntry,
};
pub use dynamic::{DynamicOptions, DynamicOptionsProvider, StaticDynamicOptions};
pub use error::{CacheError, CacheResult, CodecError, ConfigError};
pub use expiration::Expiration;
pub use interchange::{InterchangeNames, InterchangeNamesBuilder};
pub use key::CacheKey;
pub use key_service::{
    AsAny, KeyProvider, KeyService, KeyServiceBuilder, Keyable, MethodCallKey, Structural,
    METHOD_CALL_TAG,
};
pub use location::{LocationId, LOCAL_SELF_ID};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
