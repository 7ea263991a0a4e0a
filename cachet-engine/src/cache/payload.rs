//! Shared key handle passed to locations.
//!
//! The encoded form is computed at most once, however many locations a
//! lookup touches.

use std::fmt;
use std::sync::{Arc, OnceLock};

use cachet_core::{CacheKey, CodecError};

/// Cheaply clonable key with lazily cached encoding.
#[derive(Clone)]
pub struct KeyPayload {
    inner: Arc<KeyPayloadInner>,
}

struct KeyPayloadInner {
    key: CacheKey,
    encoded: OnceLock<Result<Vec<u8>, CodecError>>,
}

impl KeyPayload {
    pub fn new(key: CacheKey) -> Self {
        Self {
            inner: Arc::new(KeyPayloadInner {
                key,
                encoded: OnceLock::new(),
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    /// Encoded key bytes.
    pub fn bytes(&self) -> Result<&[u8], CodecError> {
        match self.inner.encoded.get_or_init(|| self.inner.key.encode()) {
            Ok(bytes) => Ok(bytes.as_slice()),
            Err(e) => Err(e.clone()),
        }
    }

    /// Encoded key as text.
    pub fn as_string(&self) -> Result<String, CodecError> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl fmt::Debug for KeyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPayload").field(&self.inner.key).finish()
    }
}

impl fmt::Display for KeyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.key, f)
    }
}

impl From<CacheKey> for KeyPayload {
    fn from(key: CacheKey) -> Self {
        Self::new(key)
    }
}
