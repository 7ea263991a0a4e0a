//! Cached values.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use cachet_core::{codec, CodecError, StoredEntry};

/// Values the engine can cache, ship to peers and spill to stores.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

type Encoder = fn(&(dyn Any + Send + Sync)) -> Result<Value, CodecError>;

#[derive(Clone)]
enum EntryData {
    /// A value produced in this process.
    Typed {
        value: Arc<dyn Any + Send + Sync>,
        encode: Encoder,
    },
    /// A value received from a peer; decoded on each typed read.
    Serialized(Arc<Value>),
}

fn encode_typed<T: CacheValue>(value: &(dyn Any + Send + Sync)) -> Result<Value, CodecError> {
    match value.downcast_ref::<T>() {
        Some(v) => codec::to_value(v),
        None => Err(CodecError::TypeMismatch {
            expected: std::any::type_name::<T>().to_string(),
            got: "unknown".to_string(),
        }),
    }
}

/// Immutable `(data, type, creation date)` triple held by the local store.
#[derive(Clone)]
pub struct ValueEntry {
    data: EntryData,
    value_type: Arc<str>,
    creation_date: DateTime<Utc>,
}

impl ValueEntry {
    pub fn typed<T: CacheValue>(value: T, value_type: impl Into<Arc<str>>, creation_date: DateTime<Utc>) -> Self {
        Self {
            data: EntryData::Typed {
                value: Arc::new(value),
                encode: encode_typed::<T>,
            },
            value_type: value_type.into(),
            creation_date,
        }
    }

    pub fn serialized(value_type: impl Into<Arc<str>>, data: Value, creation_date: DateTime<Utc>) -> Self {
        Self {
            data: EntryData::Serialized(Arc::new(data)),
            value_type: value_type.into(),
            creation_date,
        }
    }

    pub fn value_type(&self) -> &str {
        &self.value_type
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    /// Read the data as `T`. `expected_type` is the interchange name of `T`.
    pub fn data_as<T: CacheValue>(&self, expected_type: &str) -> Result<T, CodecError> {
        match &self.data {
            EntryData::Typed { value, .. } => {
                value
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or_else(|| CodecError::TypeMismatch {
                        expected: expected_type.to_string(),
                        got: self.value_type.to_string(),
                    })
            }
            EntryData::Serialized(json) => {
                if &*self.value_type != expected_type {
                    return Err(CodecError::TypeMismatch {
                        expected: expected_type.to_string(),
                        got: self.value_type.to_string(),
                    });
                }
                codec::from_value(Value::clone(json))
            }
        }
    }

    pub fn to_json(&self) -> Result<Value, CodecError> {
        match &self.data {
            EntryData::Typed { value, encode } => encode(value.as_ref()),
            EntryData::Serialized(json) => Ok(Value::clone(json)),
        }
    }

    pub fn to_stored(&self) -> Result<StoredEntry, CodecError> {
        Ok(StoredEntry {
            value_type: self.value_type.to_string(),
            data: self.to_json()?,
            creation_date: self.creation_date,
        })
    }

    /// Whether the data serializes within `threshold` bytes.
    /// A threshold of zero or less means nothing is small.
    pub fn is_small(&self, threshold: i64) -> bool {
        if threshold <= 0 {
            return false;
        }
        match self.to_json() {
            Ok(json) => codec::fits_within(&json, threshold as usize),
            Err(_) => false,
        }
    }

    /// Size estimate of the data; `u64::MAX` when it cannot be computed.
    pub fn size_heuristic(&self) -> u64 {
        match self.to_json() {
            Ok(json) => codec::size_heuristic(&json),
            Err(e) => {
                tracing::warn!(error = %e, value_type = %self.value_type, "Error calculating value size");
                u64::MAX
            }
        }
    }
}

impl fmt::Debug for ValueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.data {
            EntryData::Typed { .. } => "typed",
            EntryData::Serialized(_) => "serialized",
        };
        f.debug_struct("ValueEntry")
            .field("value_type", &self.value_type)
            .field("creation_date", &self.creation_date)
            .field("data", &kind)
            .finish()
    }
}
