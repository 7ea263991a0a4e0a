//! Canonical cache keys.
//!
//! A [`CacheKey`] is plain data: equality, hashing and serialized bytes are
//! all derived from its structure, so two processes that derive the same key
//! from the same arguments agree on all three.
//!
//! # Design
//!
//! - Maps are `BTreeMap`, so serialized field order is fixed.
//! - Floats are stored as canonical bit patterns (`-0.0` folds to `0.0`,
//!   every NaN folds to one NaN) so `Eq` and `Hash` hold.
//! - `Tagged` carries a type tag next to a structural payload; peers rebuild
//!   the same key without knowing the concrete type.
//! - `Identity` is the process-local fallback for values nothing could key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::CodecError;

/// Structurally comparable, serializable cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKey {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// Canonical IEEE-754 bits.
    Float(u64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<CacheKey>),
    Map(BTreeMap<String, CacheKey>),
    Tagged { tag: String, payload: Box<CacheKey> },
    /// Address-based identity; only meaningful inside one process.
    Identity(u64),
}

impl CacheKey {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn float(value: f64) -> Self {
        let canonical = if value == 0.0 {
            0.0f64
        } else if value.is_nan() {
            f64::NAN
        } else {
            value
        };
        Self::Float(canonical.to_bits())
    }

    pub fn array(items: impl IntoIterator<Item = CacheKey>) -> Self {
        Self::Array(items.into_iter().collect())
    }

    pub fn tagged(tag: impl Into<String>, payload: CacheKey) -> Self {
        Self::Tagged {
            tag: tag.into(),
            payload: Box::new(payload),
        }
    }

    /// Tag of a `Tagged` key.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Tagged { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Payload of a `Tagged` key.
    pub fn payload(&self) -> Option<&CacheKey> {
        match self {
            Self::Tagged { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn is_process_local(&self) -> bool {
        match self {
            Self::Identity(_) => true,
            Self::Array(items) => items.iter().any(Self::is_process_local),
            Self::Map(entries) => entries.values().any(Self::is_process_local),
            Self::Tagged { payload, .. } => payload.is_process_local(),
            _ => false,
        }
    }

    /// Build a key from a JSON value.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::Str(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Cross-process byte encoding.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Serialize {
            type_name: "CacheKey".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize {
            type_name: "CacheKey".to_string(),
            reason: e.to_string(),
        })
    }

    /// Hex SHA-256 of the encoded key, for stores with key length limits.
    pub fn digest(&self) -> Result<String, CodecError> {
        let bytes = self.encode()?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::UInt(u) => write!(f, "{}", u),
            Self::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            Self::Tagged { tag, payload } => write!(f, "{}({})", tag, payload),
            Self::Identity(addr) => write!(f, "#{:x}", addr),
        }
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for CacheKey {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for CacheKey {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for CacheKey {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<u64> for CacheKey {
    fn from(u: u64) -> Self {
        // Keep small unsigned values in the same variant as their signed
        // counterparts, matching what JSON round-trips produce.
        match i64::try_from(u) {
            Ok(i) => Self::Int(i),
            Err(_) => Self::UInt(u),
        }
    }
}

impl From<u32> for CacheKey {
    fn from(u: u32) -> Self {
        Self::Int(u as i64)
    }
}

impl From<f64> for CacheKey {
    fn from(v: f64) -> Self {
        Self::float(v)
    }
}

impl From<Vec<CacheKey>> for CacheKey {
    fn from(items: Vec<CacheKey>) -> Self {
        Self::Array(items)
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf() -> impl Strategy<Value = CacheKey> {
        prop_oneof![
            Just(CacheKey::Null),
            any::<bool>().prop_map(CacheKey::Bool),
            any::<i64>().prop_map(CacheKey::Int),
            any::<f64>().prop_map(CacheKey::float),
            "[a-z0-9]{0,12}".prop_map(CacheKey::Str),
        ]
    }

    fn key() -> impl Strategy<Value = CacheKey> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(CacheKey::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner.clone(), 0..3).prop_map(CacheKey::Map),
                ("[A-Z]{2,4}", inner).prop_map(|(t, p)| CacheKey::tagged(t, p)),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Equal keys encode to identical bytes and decode back to an equal key.
        #[test]
        fn prop_equal_keys_share_bytes(k in key()) {
            let copy = k.clone();
            let bytes = k.encode().unwrap();
            prop_assert_eq!(&bytes, &copy.encode().unwrap());
            prop_assert_eq!(CacheKey::decode(&bytes).unwrap(), k);
        }

        /// Wrapping keys that differ in one element yields different keys.
        #[test]
        fn prop_differing_sub_key_differs(a in key(), b in key(), prefix in key()) {
            prop_assume!(a != b);
            let left = CacheKey::array(vec![prefix.clone(), a]);
            let right = CacheKey::array(vec![prefix, b]);
            prop_assert_ne!(&left, &right);
            prop_assert_ne!(left.encode().unwrap(), right.encode().unwrap());
        }
    }
}
