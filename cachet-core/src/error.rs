//! Error types for cache operations

use std::sync::Arc;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Duplicate interchange name: {name}")]
    DuplicateInterchangeName { name: String },
}

/// Serialization boundary errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Serialization of {type_name} failed: {reason}")]
    Serialize { type_name: String, reason: String },

    #[error("Deserialization of {type_name} failed: {reason}")]
    Deserialize { type_name: String, reason: String },

    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },
}

/// Master error type for cache operations.
///
/// Only origin failures and cancellation reach callers of `get`; location and
/// notifier failures are logged and absorbed by the engine.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Origin fetch failed: {source}")]
    OriginFetch {
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl CacheError {
    /// Wrap an origin failure, keeping the source error reachable.
    pub fn origin<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::OriginFetch {
            source: Arc::new(error),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_origin_failure(&self) -> bool {
        matches!(self, Self::OriginFetch { .. })
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream exploded")]
    struct Upstream;

    #[test]
    fn test_origin_error_keeps_source() {
        let err = CacheError::origin(Upstream);
        assert!(err.is_origin_failure());
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "Origin fetch failed: upstream exploded");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("upstream exploded"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: CacheError = ConfigError::MissingRequired {
            field: "size_limit".to_string(),
        }
        .into();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::TypeMismatch {
            expected: "user".to_string(),
            got: "order".to_string(),
        };
        assert_eq!(err.to_string(), "Type mismatch: expected user, got order");
    }
}
