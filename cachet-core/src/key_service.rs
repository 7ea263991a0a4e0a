//! Key canonicalization.
//!
//! [`KeyService::to_key`] turns call arguments into a [`CacheKey`]. Types opt
//! in through the [`Keyable`] capability trait; applications can register
//! [`KeyProvider`]s for types they do not own.
//!
//! Resolution order:
//! 1. the argument already is a `CacheKey`
//! 2. the argument keys itself (`Keyable::self_key`)
//! 3. registered providers, first hit wins
//! 4. built-ins: strings, sequences, value types, structural types
//!
//! When nothing applies `to_key` returns `None` and callers fall back to
//! [`KeyService::key_or_identity`].
//!
//! # Example
//!
//! ```ignore
//! let keys = KeyService::new();
//! let key = keys.method_call::<UserRepo>("load", &[&tenant_id, &user_id]);
//! let order_free = keys.wrap_sorted_by_key(&[3, 1, 2], |x| *x);
//! assert_eq!(order_free, keys.wrap(&[1, 2, 3]));
//! ```

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::{codec, CacheKey, InterchangeNames};

/// Tag of method-call keys.
pub const METHOD_CALL_TAG: &str = "MCCK";

/// Access to the concrete type behind a `dyn Keyable`.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capability interface for values usable as cache key material.
///
/// Every method defaults to "not applicable"; implement only the one that
/// describes the type.
pub trait Keyable: AsAny + Send + Sync + 'static {
    /// Produce a key directly.
    fn self_key(&self, keys: &KeyService) -> Option<CacheKey> {
        let _ = keys;
        None
    }

    /// Ordered elements of a sequence type.
    fn elements(&self) -> Option<Vec<&dyn Keyable>> {
        None
    }

    /// Key of a type with value equality.
    fn value_key(&self) -> Option<CacheKey> {
        None
    }

    /// Key of a type compared structurally.
    fn structural_key(&self, names: &InterchangeNames) -> Option<CacheKey> {
        let _ = names;
        None
    }
}

/// Application-supplied key derivation, consulted before the built-ins.
pub trait KeyProvider: Send + Sync {
    fn to_key(&self, keys: &KeyService, obj: &dyn Keyable) -> Option<CacheKey>;
}

impl<F> KeyProvider for F
where
    F: Fn(&KeyService, &dyn Keyable) -> Option<CacheKey> + Send + Sync,
{
    fn to_key(&self, keys: &KeyService, obj: &dyn Keyable) -> Option<CacheKey> {
        self(keys, obj)
    }
}

/// Canonicalizes arguments into cache keys.
#[derive(Clone)]
pub struct KeyService {
    providers: Arc<Vec<Arc<dyn KeyProvider>>>,
    names: Arc<InterchangeNames>,
}

/// Builder for [`KeyService`].
#[derive(Default)]
pub struct KeyServiceBuilder {
    providers: Vec<Arc<dyn KeyProvider>>,
    names: Option<Arc<InterchangeNames>>,
}

impl KeyServiceBuilder {
    /// Append a provider. Providers run in registration order.
    pub fn provider(mut self, provider: impl KeyProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    pub fn names(mut self, names: InterchangeNames) -> Self {
        self.names = Some(Arc::new(names));
        self
    }

    pub fn build(self) -> KeyService {
        KeyService {
            providers: Arc::new(self.providers),
            names: self.names.unwrap_or_default(),
        }
    }
}

impl Default for KeyService {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyService")
            .field("providers", &self.providers.len())
            .field("names", &self.names.len())
            .finish()
    }
}

impl KeyService {
    /// A service with no providers and no interchange names.
    pub fn new() -> Self {
        KeyServiceBuilder::default().build()
    }

    pub fn builder() -> KeyServiceBuilder {
        KeyServiceBuilder::default()
    }

    pub fn names(&self) -> &InterchangeNames {
        &self.names
    }

    pub fn shared_names(&self) -> Arc<InterchangeNames> {
        Arc::clone(&self.names)
    }

    pub fn to_key(&self, obj: &dyn Keyable) -> Option<CacheKey> {
        if let Some(key) = obj.as_any().downcast_ref::<CacheKey>() {
            return Some(key.clone());
        }

        if let Some(key) = obj.self_key(self) {
            return Some(key);
        }

        for provider in self.providers.iter() {
            if let Some(key) = provider.to_key(self, obj) {
                return Some(key);
            }
        }

        let any = obj.as_any();
        if let Some(s) = any.downcast_ref::<String>() {
            return Some(CacheKey::Str(s.clone()));
        }
        if let Some(s) = any.downcast_ref::<&'static str>() {
            return Some(CacheKey::Str((*s).to_string()));
        }

        if let Some(elements) = obj.elements() {
            return Some(self.wrap_dyn(&elements));
        }

        if let Some(key) = obj.value_key() {
            return Some(key);
        }

        obj.structural_key(&self.names)
    }

    /// `to_key`, falling back to the address of `obj`.
    pub fn key_or_identity(&self, obj: &dyn Keyable) -> CacheKey {
        self.to_key(obj).unwrap_or_else(|| identity_of(obj))
    }

    /// Order-preserving composite key.
    pub fn wrap<T: Keyable>(&self, items: &[T]) -> CacheKey {
        CacheKey::Array(items.iter().map(|item| self.key_or_identity(item)).collect())
    }

    /// Order-preserving composite key over heterogeneous items.
    pub fn wrap_dyn(&self, items: &[&dyn Keyable]) -> CacheKey {
        CacheKey::Array(items.iter().map(|item| self.key_or_identity(*item)).collect())
    }

    /// Composite key over items sorted by `order` first.
    pub fn wrap_sorted_by_key<T, K, F>(&self, items: &[T], mut order: F) -> CacheKey
    where
        T: Keyable,
        K: Ord,
        F: FnMut(&T) -> K,
    {
        let mut sorted: Vec<&T> = items.iter().collect();
        sorted.sort_by_key(|item| order(item));
        CacheKey::Array(sorted.into_iter().map(|item| self.key_or_identity(item)).collect())
    }

    /// Composite key over items sorted with a custom comparer.
    pub fn wrap_sorted_by<T, F>(&self, items: &[T], mut compare: F) -> CacheKey
    where
        T: Keyable,
        F: FnMut(&T, &T) -> Ordering,
    {
        let mut sorted: Vec<&T> = items.iter().collect();
        sorted.sort_by(|a, b| compare(a, b));
        CacheKey::Array(sorted.into_iter().map(|item| self.key_or_identity(item)).collect())
    }

    /// Key for a call of `method` on `T` with `args`.
    pub fn method_call<T: 'static>(&self, method: &str, args: &[&dyn Keyable]) -> CacheKey {
        MethodCallKey::new(self, self.names.name_of::<T>(), method, args).to_key()
    }
}

fn identity_of(obj: &dyn Keyable) -> CacheKey {
    CacheKey::Identity(obj as *const dyn Keyable as *const () as usize as u64)
}

// ============================================================================
// BUILT-IN KEYABLE IMPLEMENTATIONS
// ============================================================================

impl Keyable for CacheKey {}

impl Keyable for String {
    fn value_key(&self) -> Option<CacheKey> {
        Some(CacheKey::Str(self.clone()))
    }
}

impl Keyable for &'static str {
    fn value_key(&self) -> Option<CacheKey> {
        Some(CacheKey::Str((*self).to_string()))
    }
}

macro_rules! value_keyable {
    ($($t:ty),*) => {
        $(
            impl Keyable for $t {
                fn value_key(&self) -> Option<CacheKey> {
                    Some(CacheKey::from(*self))
                }
            }
        )*
    };
}

value_keyable!(bool, i32, i64, u32, u64, f64);

impl Keyable for char {
    fn value_key(&self) -> Option<CacheKey> {
        Some(CacheKey::Str(self.to_string()))
    }
}

impl Keyable for uuid::Uuid {
    fn value_key(&self) -> Option<CacheKey> {
        Some(CacheKey::Str(self.to_string()))
    }
}

impl<T: Keyable> Keyable for Vec<T> {
    fn elements(&self) -> Option<Vec<&dyn Keyable>> {
        Some(self.iter().map(|item| item as &dyn Keyable).collect())
    }
}

impl<T: Keyable, const N: usize> Keyable for [T; N] {
    fn elements(&self) -> Option<Vec<&dyn Keyable>> {
        Some(self.iter().map(|item| item as &dyn Keyable).collect())
    }
}

impl<A: Keyable, B: Keyable> Keyable for (A, B) {
    fn elements(&self) -> Option<Vec<&dyn Keyable>> {
        Some(vec![&self.0 as &dyn Keyable, &self.1])
    }
}

impl<A: Keyable, B: Keyable, C: Keyable> Keyable for (A, B, C) {
    fn elements(&self) -> Option<Vec<&dyn Keyable>> {
        Some(vec![&self.0 as &dyn Keyable, &self.1, &self.2])
    }
}

impl<T: Keyable> Keyable for Option<T> {
    fn self_key(&self, keys: &KeyService) -> Option<CacheKey> {
        Some(match self {
            Some(inner) => keys.key_or_identity(inner),
            None => CacheKey::Null,
        })
    }
}

/// Adapter keying a serializable value by its structure.
///
/// The key is tagged with the interchange name of `T`, so two types with the
/// same shape never collide.
#[derive(Debug, Clone, PartialEq)]
pub struct Structural<T>(pub T);

impl<T> Keyable for Structural<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn structural_key(&self, names: &InterchangeNames) -> Option<CacheKey> {
        let payload = codec::to_value(&self.0).ok()?;
        Some(CacheKey::tagged(names.name_of::<T>(), CacheKey::from_json(&payload)))
    }
}

/// Composite key identifying a method call: owner type, method name and the
/// canonicalized arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodCallKey {
    type_name: String,
    method: String,
    arguments: CacheKey,
}

impl MethodCallKey {
    pub fn new(keys: &KeyService, type_name: impl Into<String>, method: impl Into<String>, args: &[&dyn Keyable]) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
            arguments: keys.wrap_dyn(args),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn arguments(&self) -> &CacheKey {
        &self.arguments
    }

    pub fn to_key(&self) -> CacheKey {
        CacheKey::tagged(
            METHOD_CALL_TAG,
            CacheKey::array(vec![
                CacheKey::Str(self.type_name.clone()),
                CacheKey::Str(self.method.clone()),
                self.arguments.clone(),
            ]),
        )
    }

    /// Recover a method-call key from its canonical form.
    pub fn from_key(key: &CacheKey) -> Option<Self> {
        if key.tag() != Some(METHOD_CALL_TAG) {
            return None;
        }
        match key.payload()? {
            CacheKey::Array(parts) => match parts.as_slice() {
                [CacheKey::Str(type_name), CacheKey::Str(method), arguments] => Some(Self {
                    type_name: type_name.clone(),
                    method: method.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Keyable for MethodCallKey {
    fn self_key(&self, _keys: &KeyService) -> Option<CacheKey> {
        Some(self.to_key())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Sorting before wrapping makes argument order irrelevant.
        #[test]
        fn prop_sorted_wrap_ignores_order(mut items in prop::collection::vec(any::<i64>(), 0..8), seed in any::<u64>()) {
            let keys = KeyService::new();
            let baseline = keys.wrap_sorted_by_key(&items, |x| *x);
            let len = items.len();
            if len > 1 {
                items.rotate_left((seed as usize) % len);
            }
            prop_assert_eq!(keys.wrap_sorted_by_key(&items, |x| *x), baseline);
        }

        /// Canonicalizing the same strings twice gives equal keys and bytes.
        #[test]
        fn prop_same_input_same_bytes(items in prop::collection::vec("[a-z]{0,6}", 0..6)) {
            let keys = KeyService::new();
            let a = keys.to_key(&items.clone()).unwrap();
            let b = keys.to_key(&items).unwrap();
            prop_assert_eq!(a.encode().unwrap(), b.encode().unwrap());
            prop_assert_eq!(a, b);
        }
    }
}
