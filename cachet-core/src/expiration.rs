//! Expiration and max-age values.
//!
//! An [`Expiration`] is either a finite duration or `Never`. Ordering puts
//! every finite duration below `Never`, so "pick the tighter of two limits"
//! is a plain `min`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// A duration limit that may be unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Expiration {
    /// Expires after the given duration.
    After(Duration),
    /// Never expires.
    Never,
}

impl Expiration {
    pub const ZERO: Expiration = Expiration::After(Duration::ZERO);

    pub fn from_secs(secs: u64) -> Self {
        Self::After(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::After(Duration::from_millis(millis))
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// The finite duration, or `None` for `Never`.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::After(d) => Some(*d),
            Self::Never => None,
        }
    }

    /// Pick the effective limit from a dynamic override, an operation
    /// override and a fallback default.
    ///
    /// A missing dynamic value counts as `Never`; a missing operation value
    /// defers to the fallback. The tighter of the two wins.
    pub fn choose(dynamic: Option<Expiration>, operation: Option<Expiration>, fallback: Expiration) -> Self {
        let dynamic = dynamic.unwrap_or(Self::Never);
        let operation = operation.unwrap_or(fallback);
        dynamic.min(operation)
    }
}

impl Default for Expiration {
    fn default() -> Self {
        Self::Never
    }
}

impl From<Duration> for Expiration {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::After(d) if d.subsec_millis() != 0 || d.as_secs() == 0 && !d.is_zero() => {
                write!(f, "{}ms", d.as_millis())
            }
            Self::After(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}

impl FromStr for Expiration {
    type Err = ConfigError;

    /// Accepts `never`, plain seconds (`30`), or a number with one of the
    /// suffixes `ms`, `s`, `m`, `h`, `d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        if raw == "never" {
            return Ok(Self::Never);
        }

        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: "expiration".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (digits, unit_millis) = if let Some(n) = raw.strip_suffix("ms") {
            (n, 1u64)
        } else if let Some(n) = raw.strip_suffix('s') {
            (n, 1_000)
        } else if let Some(n) = raw.strip_suffix('m') {
            (n, 60_000)
        } else if let Some(n) = raw.strip_suffix('h') {
            (n, 3_600_000)
        } else if let Some(n) = raw.strip_suffix('d') {
            (n, 86_400_000)
        } else {
            (raw.as_str(), 1_000)
        };

        let amount: u64 = digits
            .trim()
            .parse()
            .map_err(|_| invalid("expected 'never' or a non-negative number with optional ms/s/m/h/d suffix"))?;
        let millis = amount
            .checked_mul(unit_millis)
            .ok_or_else(|| invalid("duration overflows"))?;
        Ok(Self::After(Duration::from_millis(millis)))
    }
}

impl TryFrom<String> for Expiration {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Expiration> for String {
    fn from(value: Expiration) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!("never".parse::<Expiration>().ok(), Some(Expiration::Never));
        assert_eq!("NEVER".parse::<Expiration>().ok(), Some(Expiration::Never));
        assert_eq!("30".parse::<Expiration>().ok(), Some(Expiration::from_secs(30)));
        assert_eq!("250ms".parse::<Expiration>().ok(), Some(Expiration::from_millis(250)));
        assert_eq!("10s".parse::<Expiration>().ok(), Some(Expiration::from_secs(10)));
        assert_eq!("5m".parse::<Expiration>().ok(), Some(Expiration::from_secs(300)));
        assert_eq!("2h".parse::<Expiration>().ok(), Some(Expiration::from_secs(7200)));
        assert_eq!("1d".parse::<Expiration>().ok(), Some(Expiration::from_secs(86_400)));
        assert_eq!("0".parse::<Expiration>().ok(), Some(Expiration::ZERO));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("-5".parse::<Expiration>().is_err());
        assert!("soon".parse::<Expiration>().is_err());
        assert!("".parse::<Expiration>().is_err());
    }

    #[test]
    fn test_never_is_largest() {
        assert!(Expiration::from_secs(u64::MAX / 2) < Expiration::Never);
        assert!(Expiration::ZERO < Expiration::from_millis(1));
    }

    #[test]
    fn test_choose_takes_tightest() {
        let fallback = Expiration::from_secs(600);
        assert_eq!(Expiration::choose(None, None, fallback), fallback);
        assert_eq!(
            Expiration::choose(None, Some(Expiration::from_secs(60)), fallback),
            Expiration::from_secs(60)
        );
        assert_eq!(
            Expiration::choose(Some(Expiration::from_secs(5)), Some(Expiration::from_secs(60)), fallback),
            Expiration::from_secs(5)
        );
        assert_eq!(
            Expiration::choose(Some(Expiration::Never), None, Expiration::Never),
            Expiration::Never
        );
    }

    #[test]
    fn test_display_roundtrips_through_serde() {
        for exp in [
            Expiration::Never,
            Expiration::ZERO,
            Expiration::from_secs(42),
            Expiration::from_millis(1500),
        ] {
            let json = serde_json::to_string(&exp).unwrap();
            let back: Expiration = serde_json::from_str(&json).unwrap();
            assert_eq!(back, exp, "via {}", json);
        }
    }
}
