//! Engine configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Expiration};

pub const DEFAULT_LOCATION_PREFETCH_COUNT: usize = 5;
pub const DEFAULT_LOCATION_MAX_PARALLELISM: usize = 2;
pub const DEFAULT_MISS_VALUE_SIZE_THRESHOLD: i64 = 5_000;
pub const DEFAULT_LOW_PRIORITY_SIZE_THRESHOLD: u64 = 20_000;
pub const DEFAULT_MID_PRIORITY_SIZE_THRESHOLD: u64 = 10_000;
pub const DEFAULT_LOCAL_ENTRY_TOLERANCE_SECS: u64 = 10;
pub const DEFAULT_SIZE_LIMIT: u64 = 10_000_000;

/// How a freshly stored value is announced to the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Announce every miss; inline the value when it is small.
    #[default]
    InMemory,
    /// Inline small values, spill large ones to passive locations.
    MixedPassive,
    /// Always spill to passive locations, never announce directly.
    PurePassive,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InMemory => "in_memory",
            Self::MixedPassive => "mixed_passive",
            Self::PurePassive => "pure_passive",
        };
        f.write_str(s)
    }
}

impl FromStr for CacheMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "inmemory" => Ok(Self::InMemory),
            "mixedpassive" => Ok(Self::MixedPassive),
            "purepassive" => Ok(Self::PurePassive),
            _ => Err(ConfigError::InvalidValue {
                field: "mode".to_string(),
                value: s.to_string(),
                reason: "expected in_memory, mixed_passive or pure_passive".to_string(),
            }),
        }
    }
}

/// Process-wide engine options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreOptions {
    /// Default max-age for reads.
    pub max_age: Expiration,
    /// Default absolute expiration of local records.
    pub absolute_expiration: Expiration,
    /// Default sliding expiration of local records.
    pub sliding_expiration: Expiration,
    /// Announcement mode.
    pub mode: CacheMode,
    /// Maximum number of locations tried per race.
    pub location_prefetch_count: usize,
    /// Maximum number of locations queried at once.
    pub location_max_parallelism: usize,
    /// Optional cap on a single location attempt.
    pub location_attempt_timeout: Option<Duration>,
    /// Values that serialize within this many bytes are inlined in miss
    /// announcements. Zero or negative disables inlining.
    pub miss_value_size_threshold: i64,
    /// Records at or above this size get low eviction priority.
    pub low_priority_size_threshold: u64,
    /// Records at or above this size get normal eviction priority.
    pub mid_priority_size_threshold: u64,
    /// How much newer an external copy must be before it beats a local one.
    pub local_entry_tolerance: Duration,
    /// Size budget of the local store.
    pub size_limit: u64,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            max_age: Expiration::Never,
            absolute_expiration: Expiration::Never,
            sliding_expiration: Expiration::Never,
            mode: CacheMode::InMemory,
            location_prefetch_count: DEFAULT_LOCATION_PREFETCH_COUNT,
            location_max_parallelism: DEFAULT_LOCATION_MAX_PARALLELISM,
            location_attempt_timeout: None,
            miss_value_size_threshold: DEFAULT_MISS_VALUE_SIZE_THRESHOLD,
            low_priority_size_threshold: DEFAULT_LOW_PRIORITY_SIZE_THRESHOLD,
            mid_priority_size_threshold: DEFAULT_MID_PRIORITY_SIZE_THRESHOLD,
            local_entry_tolerance: Duration::from_secs(DEFAULT_LOCAL_ENTRY_TOLERANCE_SECS),
            size_limit: DEFAULT_SIZE_LIMIT,
        }
    }
}

impl CoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    ///
    /// # Environment Variables
    /// - `CACHET_MAX_AGE`: default max-age, e.g. `10m` or `never` (default: never)
    /// - `CACHET_ABSOLUTE_EXPIRATION`: default absolute expiration (default: never)
    /// - `CACHET_SLIDING_EXPIRATION`: default sliding expiration (default: never)
    /// - `CACHET_MODE`: `in_memory`, `mixed_passive` or `pure_passive` (default: in_memory)
    /// - `CACHET_LOCATION_PREFETCH_COUNT`: locations tried per race (default: 5)
    /// - `CACHET_LOCATION_MAX_PARALLELISM`: concurrent location queries (default: 2)
    /// - `CACHET_LOCATION_ATTEMPT_TIMEOUT_MS`: per-location timeout (default: none)
    /// - `CACHET_MISS_VALUE_SIZE_THRESHOLD`: inline threshold in bytes (default: 5000)
    /// - `CACHET_LOW_PRIORITY_SIZE_THRESHOLD`: (default: 20000)
    /// - `CACHET_MID_PRIORITY_SIZE_THRESHOLD`: (default: 10000)
    /// - `CACHET_LOCAL_ENTRY_TOLERANCE_SECS`: (default: 10)
    /// - `CACHET_SIZE_LIMIT`: local store budget (default: 10000000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn var<T: FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
        }

        Self {
            max_age: var("CACHET_MAX_AGE").unwrap_or(defaults.max_age),
            absolute_expiration: var("CACHET_ABSOLUTE_EXPIRATION").unwrap_or(defaults.absolute_expiration),
            sliding_expiration: var("CACHET_SLIDING_EXPIRATION").unwrap_or(defaults.sliding_expiration),
            mode: var("CACHET_MODE").unwrap_or(defaults.mode),
            location_prefetch_count: var("CACHET_LOCATION_PREFETCH_COUNT")
                .unwrap_or(defaults.location_prefetch_count),
            location_max_parallelism: var("CACHET_LOCATION_MAX_PARALLELISM")
                .unwrap_or(defaults.location_max_parallelism),
            location_attempt_timeout: var::<u64>("CACHET_LOCATION_ATTEMPT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .or(defaults.location_attempt_timeout),
            miss_value_size_threshold: var("CACHET_MISS_VALUE_SIZE_THRESHOLD")
                .unwrap_or(defaults.miss_value_size_threshold),
            low_priority_size_threshold: var("CACHET_LOW_PRIORITY_SIZE_THRESHOLD")
                .unwrap_or(defaults.low_priority_size_threshold),
            mid_priority_size_threshold: var("CACHET_MID_PRIORITY_SIZE_THRESHOLD")
                .unwrap_or(defaults.mid_priority_size_threshold),
            local_entry_tolerance: var::<u64>("CACHET_LOCAL_ENTRY_TOLERANCE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.local_entry_tolerance),
            size_limit: var("CACHET_SIZE_LIMIT").unwrap_or(defaults.size_limit),
        }
    }

    /// Validate the options.
    ///
    /// Validates:
    /// - location_prefetch_count > 0
    /// - location_max_parallelism > 0
    /// - location_max_parallelism <= location_prefetch_count
    /// - mid_priority_size_threshold <= low_priority_size_threshold
    /// - size_limit > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.location_prefetch_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "location_prefetch_count".to_string(),
                value: self.location_prefetch_count.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        if self.location_max_parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                field: "location_max_parallelism".to_string(),
                value: self.location_max_parallelism.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        if self.location_max_parallelism > self.location_prefetch_count {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("location_max_parallelism={}", self.location_max_parallelism),
                option_b: format!("location_prefetch_count={}", self.location_prefetch_count),
            });
        }

        if self.mid_priority_size_threshold > self.low_priority_size_threshold {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("mid_priority_size_threshold={}", self.mid_priority_size_threshold),
                option_b: format!("low_priority_size_threshold={}", self.low_priority_size_threshold),
            });
        }

        if self.size_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "size_limit".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(())
    }

    pub fn with_max_age(mut self, max_age: Expiration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_absolute_expiration(mut self, expiration: Expiration) -> Self {
        self.absolute_expiration = expiration;
        self
    }

    pub fn with_sliding_expiration(mut self, expiration: Expiration) -> Self {
        self.sliding_expiration = expiration;
        self
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_location_prefetch_count(mut self, count: usize) -> Self {
        self.location_prefetch_count = count;
        self
    }

    pub fn with_location_max_parallelism(mut self, parallelism: usize) -> Self {
        self.location_max_parallelism = parallelism;
        self
    }

    pub fn with_location_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.location_attempt_timeout = Some(timeout);
        self
    }

    pub fn with_miss_value_size_threshold(mut self, threshold: i64) -> Self {
        self.miss_value_size_threshold = threshold;
        self
    }

    pub fn with_priority_thresholds(mut self, mid: u64, low: u64) -> Self {
        self.mid_priority_size_threshold = mid;
        self.low_priority_size_threshold = low;
        self
    }

    pub fn with_local_entry_tolerance(mut self, tolerance: Duration) -> Self {
        self.local_entry_tolerance = tolerance;
        self
    }

    pub fn with_size_limit(mut self, limit: u64) -> Self {
        self.size_limit = limit;
        self
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOptions {
    /// Bypass the cache entirely.
    pub disabled: bool,
    pub max_age: Option<Expiration>,
    pub absolute_expiration: Option<Expiration>,
    pub sliding_expiration: Option<Expiration>,
}

impl OperationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    pub fn with_max_age(mut self, max_age: Expiration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_absolute_expiration(mut self, expiration: Expiration) -> Self {
        self.absolute_expiration = Some(expiration);
        self
    }

    pub fn with_sliding_expiration(mut self, expiration: Expiration) -> Self {
        self.sliding_expiration = Some(expiration);
        self
    }
}
