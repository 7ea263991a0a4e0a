//! Interchange names for types crossing process boundaries.
//!
//! Values and structural keys are tagged with a stable name instead of the
//! Rust type path, so moving or renaming a type does not break peers still
//! running the previous build. The table is built once at startup and is
//! immutable afterwards.

use std::any::{type_name, TypeId};
use std::collections::HashMap;

use crate::ConfigError;

/// Immutable bidirectional `TypeId` <-> name table.
#[derive(Debug, Clone, Default)]
pub struct InterchangeNames {
    by_type: HashMap<TypeId, String>,
    by_name: HashMap<String, TypeId>,
}

/// Builder for [`InterchangeNames`].
#[derive(Debug, Default)]
pub struct InterchangeNamesBuilder {
    entries: Vec<(TypeId, String)>,
}

impl InterchangeNamesBuilder {
    /// Declare the interchange name of `T`.
    pub fn register<T: 'static>(mut self, name: impl Into<String>) -> Self {
        self.entries.push((TypeId::of::<T>(), name.into()));
        self
    }

    /// Freeze the table. Two types claiming one name, or one type claiming
    /// two names, is a startup error.
    pub fn build(self) -> Result<InterchangeNames, ConfigError> {
        let mut names = InterchangeNames::default();
        for (type_id, name) in self.entries {
            if names.by_name.contains_key(&name) {
                return Err(ConfigError::DuplicateInterchangeName { name });
            }
            if let Some(existing) = names.by_type.get(&type_id) {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: existing.clone(),
                    option_b: name,
                });
            }
            names.by_type.insert(type_id, name.clone());
            names.by_name.insert(name, type_id);
        }
        Ok(names)
    }
}

impl InterchangeNames {
    pub fn builder() -> InterchangeNamesBuilder {
        InterchangeNamesBuilder::default()
    }

    /// Interchange name of `T`, falling back to its Rust type path.
    pub fn name_of<T: 'static>(&self) -> String {
        self.by_type
            .get(&TypeId::of::<T>())
            .cloned()
            .unwrap_or_else(|| type_name::<T>().to_string())
    }

    /// Registered type for a name.
    pub fn type_of(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Whether `name` designates `T`.
    pub fn is<T: 'static>(&self, name: &str) -> bool {
        match self.type_of(name) {
            Some(id) => id == TypeId::of::<T>(),
            None => name == type_name::<T>(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
