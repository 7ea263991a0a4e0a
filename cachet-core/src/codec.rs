//! Serialization boundary.
//!
//! Everything that leaves the process goes through these helpers; callers
//! never depend on the byte format itself.

use std::any::type_name;
use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::CodecError;

/// Depth past which the size heuristic gives up.
const MAX_SIZE_DEPTH: usize = 64;

pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Serialize {
        type_name: type_name::<T>().to_string(),
        reason: e.to_string(),
    })
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize {
        type_name: type_name::<T>().to_string(),
        reason: e.to_string(),
    })
}

pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::Serialize {
        type_name: type_name::<T>().to_string(),
        reason: e.to_string(),
    })
}

pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::Deserialize {
        type_name: type_name::<T>().to_string(),
        reason: e.to_string(),
    })
}

/// Writer that refuses to grow past a fixed number of bytes.
struct BoundedWriter {
    written: usize,
    limit: usize,
}

impl io::Write for BoundedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() > self.limit {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "size limit exceeded"));
        }
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Whether `value` serializes within `limit` bytes. Serialization stops as
/// soon as the limit is crossed, so large values are cheap to reject.
pub fn fits_within<T: Serialize + ?Sized>(value: &T, limit: usize) -> bool {
    let mut writer = BoundedWriter { written: 0, limit };
    serde_json::to_writer(&mut writer, value).is_ok()
}

/// Rough in-memory footprint of a value tree, in bytes.
///
/// Saturates to `u64::MAX` when the tree nests deeper than the guard allows.
pub fn size_heuristic(value: &Value) -> u64 {
    fn walk(value: &Value, depth: usize) -> Option<u64> {
        if depth > MAX_SIZE_DEPTH {
            return None;
        }
        let size = match value {
            Value::Null | Value::Bool(_) => 8,
            Value::Number(_) => 16,
            Value::String(s) => 24 + s.len() as u64,
            Value::Array(items) => {
                let mut total: u64 = 24;
                for item in items {
                    total = total.saturating_add(walk(item, depth + 1)?);
                }
                total
            }
            Value::Object(map) => {
                let mut total: u64 = 48;
                for (k, v) in map {
                    total = total
                        .saturating_add(24 + k.len() as u64)
                        .saturating_add(walk(v, depth + 1)?);
                }
                total
            }
        };
        Some(size)
    }

    walk(value, 0).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_bytes_roundtrip() {
        let p = Profile {
            name: "ada".to_string(),
            tags: vec!["x".to_string()],
        };
        let bytes = to_bytes(&p).unwrap();
        assert_eq!(from_bytes::<Profile>(&bytes).unwrap(), p);
    }

    #[test]
    fn test_deserialize_error_names_type() {
        let err = from_bytes::<Profile>(b"[1,2]").unwrap_err();
        match err {
            CodecError::Deserialize { type_name, .. } => assert!(type_name.contains("Profile")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fits_within_boundary() {
        let s = "abcdefgh"; // serializes to 10 bytes with quotes
        assert!(fits_within(s, 10));
        assert!(!fits_within(s, 9));
        assert!(!fits_within(s, 0));
    }

    #[test]
    fn test_size_grows_with_content() {
        let small = size_heuristic(&json!({"a": 1}));
        let large = size_heuristic(&json!({"a": 1, "b": "x".repeat(1000)}));
        assert!(large > small + 1000);
    }

    #[test]
    fn test_size_depth_guard_saturates() {
        let mut value = json!(null);
        for _ in 0..(MAX_SIZE_DEPTH + 5) {
            value = json!([value]);
        }
        assert_eq!(size_heuristic(&value), u64::MAX);
    }
}
