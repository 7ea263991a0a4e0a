//! Time source abstraction.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};

use crate::Expiration;

/// Source of "now" for the engine.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Drop sub-second precision.
///
/// Creation dates travel between processes; whole seconds compare the same
/// on every side regardless of encoder precision.
pub fn truncate_to_seconds(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.with_nanosecond(0).unwrap_or(timestamp)
}

/// `timestamp - age`, saturating at the earliest representable instant.
/// A `Never` age yields that earliest instant.
pub fn minus_expiration(timestamp: DateTime<Utc>, age: Expiration) -> DateTime<Utc> {
    age.as_duration()
        .and_then(|d| ChronoDuration::from_std(d).ok())
        .and_then(|d| timestamp.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
