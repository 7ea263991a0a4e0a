//! Wire shapes exchanged between locations.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{codec, CacheKey, CodecError, LocationId};

/// A value as persisted by a passive location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub value_type: String,
    pub data: Value,
    pub creation_date: DateTime<Utc>,
}

/// Announcement that a fresh value for `key` exists at `source_location`.
///
/// `value_type`/`value` are present only when the emitter inlined a small
/// value so receivers can skip the fetch entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMissDescriptor {
    pub emitter: LocationId,
    pub key: CacheKey,
    pub timestamp: DateTime<Utc>,
    pub source_location: LocationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl CacheMissDescriptor {
    pub fn new(
        emitter: LocationId,
        key: CacheKey,
        timestamp: DateTime<Utc>,
        source_location: LocationId,
    ) -> Self {
        Self {
            emitter,
            key,
            timestamp,
            source_location,
            value_type: None,
            value: None,
        }
    }

    pub fn with_value(mut self, value_type: impl Into<String>, value: Value) -> Self {
        self.value_type = Some(value_type.into());
        self.value = Some(value);
        self
    }

    /// The inlined value, if both halves are present.
    pub fn inlined(&self) -> Option<(&str, &Value)> {
        match (&self.value_type, &self.value) {
            (Some(t), Some(v)) => Some((t.as_str(), v)),
            _ => None,
        }
    }
}

/// Why a rule was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// The underlying data changed.
    Updated,
    /// The underlying data was removed.
    Deleted,
    /// An operator asked for it.
    Manual,
}

/// Serializable invalidation predicate.
///
/// `kind` names the rule family and `payload` carries its parameters. Key
/// handlers registered on the engine interpret both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRule {
    pub reason: InvalidationReason,
    pub kind: String,
    pub payload: Value,
}

impl InvalidationRule {
    pub fn new(reason: InvalidationReason, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            reason,
            kind: kind.into(),
            payload,
        }
    }

    /// Build a rule from a typed payload.
    pub fn for_payload<P: Serialize>(
        reason: InvalidationReason,
        kind: impl Into<String>,
        payload: &P,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(reason, kind, codec::to_value(payload)?))
    }

    /// Read the payload back as `P`.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, CodecError> {
        codec::from_value(self.payload.clone())
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Broadcast form of an invalidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationDescriptor {
    pub emitter: LocationId,
    pub rule: InvalidationRule,
}

impl InvalidationDescriptor {
    pub fn new(emitter: LocationId, rule: InvalidationRule) -> Self {
        Self { emitter, rule }
    }
}
