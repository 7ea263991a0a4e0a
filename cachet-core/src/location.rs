//! Location identifiers.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier used by a process that runs without any fleet.
pub const LOCAL_SELF_ID: &str = "<self>";

/// Opaque identifier for a peer process or a durable store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh, time-ordered id with the given prefix, e.g. `proc-0190...`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::now_v7()))
    }

    pub fn local_self() -> Self {
        Self(LOCAL_SELF_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LocationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for LocationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
