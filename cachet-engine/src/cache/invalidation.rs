//! Invalidation capability for cache keys.
//!
//! Keys are plain data, so the "is this key affected by that rule" question
//! is answered by handlers registered on the engine. A handler is looked up
//! by the key's tag; untagged keys and tags without a handler fall through
//! to the catch-all handlers in registration order.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use cachet_core::{CacheKey, InvalidationRule};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

/// Work to run after the matching entry has been removed.
pub type InvalidationCallback = BoxFuture<'static, ()>;

pub enum InvalidationVerdict {
    Unaffected,
    Invalidated(Option<InvalidationCallback>),
}

impl InvalidationVerdict {
    pub fn invalidated() -> Self {
        Self::Invalidated(None)
    }

    pub fn invalidated_then<F>(callback: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::Invalidated(Some(callback.boxed()))
    }

    pub fn from_bool(affected: bool) -> Self {
        if affected {
            Self::invalidated()
        } else {
            Self::Unaffected
        }
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self, Self::Invalidated(_))
    }
}

impl fmt::Debug for InvalidationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unaffected => f.write_str("Unaffected"),
            Self::Invalidated(cb) => f
                .debug_tuple("Invalidated")
                .field(&cb.as_ref().map(|_| "callback"))
                .finish(),
        }
    }
}

pub trait Invalidatable: Send + Sync {
    fn check(&self, key: &CacheKey, rule: &InvalidationRule) -> InvalidationVerdict;
}

impl<F> Invalidatable for F
where
    F: Fn(&CacheKey, &InvalidationRule) -> InvalidationVerdict + Send + Sync,
{
    fn check(&self, key: &CacheKey, rule: &InvalidationRule) -> InvalidationVerdict {
        self(key, rule)
    }
}

#[derive(Clone, Default)]
pub struct InvalidationHandlers {
    by_tag: HashMap<String, Arc<dyn Invalidatable>>,
    catch_all: Vec<Arc<dyn Invalidatable>>,
}

impl fmt::Debug for InvalidationHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationHandlers")
            .field("tags", &self.by_tag.keys().collect::<Vec<_>>())
            .field("catch_all", &self.catch_all.len())
            .finish()
    }
}

impl InvalidationHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle keys tagged `tag`. A later registration for the same tag
    /// replaces the earlier one.
    pub fn register(&mut self, tag: impl Into<String>, handler: Arc<dyn Invalidatable>) {
        self.by_tag.insert(tag.into(), handler);
    }

    pub fn register_catch_all(&mut self, handler: Arc<dyn Invalidatable>) {
        self.catch_all.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty() && self.catch_all.is_empty()
    }

    pub fn check(&self, key: &CacheKey, rule: &InvalidationRule) -> InvalidationVerdict {
        if let Some(handler) = key.tag().and_then(|t| self.by_tag.get(t)) {
            return handler.check(key, rule);
        }
        for handler in &self.catch_all {
            let verdict = handler.check(key, rule);
            if verdict.is_invalidated() {
                return verdict;
            }
        }
        InvalidationVerdict::Unaffected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::InvalidationReason;
    use serde_json::json;

    fn user_rule(id: i64) -> InvalidationRule {
        InvalidationRule::new(InvalidationReason::Updated, "user", json!({ "id": id }))
    }

    fn user_handler() -> Arc<dyn Invalidatable> {
        Arc::new(|key: &CacheKey, rule: &InvalidationRule| {
            let id = rule.payload.get("id").and_then(|v| v.as_i64());
            InvalidationVerdict::from_bool(rule.is_kind("user") && key.payload() == id.map(CacheKey::from).as_ref())
        })
    }

    #[test]
    fn test_tag_handler_decides() {
        let mut handlers = InvalidationHandlers::new();
        handlers.register("user", user_handler());

        let key = CacheKey::tagged("user", CacheKey::from(7i64));
        assert!(handlers.check(&key, &user_rule(7)).is_invalidated());
        assert!(!handlers.check(&key, &user_rule(8)).is_invalidated());
    }

    #[test]
    fn test_untagged_keys_use_catch_all() {
        let mut handlers = InvalidationHandlers::new();
        handlers.register("user", user_handler());
        handlers.register_catch_all(Arc::new(|key: &CacheKey, _: &InvalidationRule| {
            InvalidationVerdict::from_bool(*key == CacheKey::from("everything"))
        }));

        assert!(handlers.check(&CacheKey::from("everything"), &user_rule(1)).is_invalidated());
        assert!(!handlers.check(&CacheKey::from("other"), &user_rule(1)).is_invalidated());
    }

    #[test]
    fn test_no_handlers_leave_keys_alone() {
        let handlers = InvalidationHandlers::new();
        assert!(handlers.is_empty());
        assert!(!handlers.check(&CacheKey::from("k"), &user_rule(1)).is_invalidated());
    }

    #[tokio::test]
    async fn test_callback_is_carried() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let verdict = InvalidationVerdict::invalidated_then(async move {
            let _ = tx.send(());
        });
        match verdict {
            InvalidationVerdict::Invalidated(Some(cb)) => cb.await,
            other => panic!("unexpected verdict: {other:?}"),
        }
        assert!(rx.await.is_ok());
    }
}
