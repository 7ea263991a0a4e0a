//! Per-caller dynamic overrides.
//!
//! Dynamic options let operators tighten caching for one calling component
//! without redeploying, e.g. forcing a short max-age on a misbehaving client.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{CacheMode, ConfigError, Expiration};

static MAX_AGE_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)(; *force *)?$").expect("Invalid max-age directive regex"));

/// Overrides resolved for a single caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicOptions {
    pub mode: Option<CacheMode>,
    pub max_age: Option<Expiration>,
    /// When set, `max_age` replaces the per-call and default max-age instead
    /// of only tightening them.
    pub force_dynamic_max_age: bool,
    /// Floor for acceptable creation dates.
    pub minimum_creation_date: Option<DateTime<Utc>>,
    pub absolute_expiration: Option<Expiration>,
    pub sliding_expiration: Option<Expiration>,
    pub miss_value_size_threshold: Option<i64>,
}

impl DynamicOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a max-age directive such as `10m` or `30s; force`.
    pub fn parse_max_age(directive: &str) -> Result<(Expiration, bool), ConfigError> {
        let captures = MAX_AGE_DIRECTIVE
            .captures(directive.trim())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "max_age".to_string(),
                value: directive.to_string(),
                reason: "unrecognized max-age directive".to_string(),
            })?;
        let expiration = captures
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .parse::<Expiration>()?;
        Ok((expiration, captures.get(2).is_some()))
    }

    pub fn with_max_age_directive(mut self, directive: &str) -> Result<Self, ConfigError> {
        let (max_age, force) = Self::parse_max_age(directive)?;
        self.max_age = Some(max_age);
        self.force_dynamic_max_age = force;
        Ok(self)
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_max_age(mut self, max_age: Expiration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_forced_max_age(mut self, max_age: Expiration) -> Self {
        self.max_age = Some(max_age);
        self.force_dynamic_max_age = true;
        self
    }

    pub fn with_minimum_creation_date(mut self, floor: DateTime<Utc>) -> Self {
        self.minimum_creation_date = Some(floor);
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

    pub fn with_miss_value_size_threshold(mut self, threshold: i64) -> Self {
        self.miss_value_size_threshold = Some(threshold);
        self
    }
}

/// Resolves dynamic overrides for a caller name.
pub trait DynamicOptionsProvider: Send + Sync + fmt::Debug {
    fn options_for(&self, caller: Option<&str>) -> DynamicOptions;
}

/// Map-backed provider with a fallback for unknown callers.
#[derive(Debug, Clone, Default)]
pub struct StaticDynamicOptions {
    fallback: DynamicOptions,
    per_caller: HashMap<String, DynamicOptions>,
}

impl StaticDynamicOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, options: DynamicOptions) -> Self {
        self.fallback = options;
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>, options: DynamicOptions) -> Self {
        self.per_caller.insert(caller.into(), options);
        self
    }
}

impl DynamicOptionsProvider for StaticDynamicOptions {
    fn options_for(&self, caller: Option<&str>) -> DynamicOptions {
        caller
            .and_then(|c| self.per_caller.get(c))
            .unwrap_or(&self.fallback)
            .clone()
    }
}
