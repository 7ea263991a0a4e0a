//! Seeding the fleet with values this process did not read itself.

use std::future::Future;

use rand::Rng;

use cachet_core::{codec, CacheError, CacheMissDescriptor, CacheResult, Keyable};

use super::engine::CacheEngine;
use super::entry::CacheValue;

/// Fetches values and hands them to one peer, leaving the local store
/// untouched.
#[derive(Debug, Clone)]
pub struct Preloader {
    engine: CacheEngine,
}

impl Preloader {
    pub(crate) fn new(engine: CacheEngine) -> Self {
        Self { engine }
    }

    /// Fetch `key` and send it, inlined, to one randomly chosen notifier.
    /// Returns the fetched value.
    pub async fn preload<T, F, Fut, E>(&self, key: &dyn Keyable, fetch: F) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = self.engine.key_of(key);
        let value = fetch().await.map_err(CacheError::origin)?;
        let Some(key) = key else {
            tracing::debug!("Argument has no stable cache key, nothing to preload");
            return Ok(value);
        };

        let self_id = self.engine.self_location_id().clone();
        let value_type = self.engine.key_service().names().name_of::<T>();
        let descriptor = CacheMissDescriptor::new(self_id.clone(), key, self.engine.now(), self_id)
            .with_value(value_type, codec::to_value(&value)?);

        let mut notifiers = self.engine.companion().get_all_event_notifiers().await;
        if notifiers.is_empty() {
            tracing::debug!(key = %descriptor.key, "No notifiers to preload into");
            return Ok(value);
        }
        let pick = rand::rng().random_range(0..notifiers.len());
        let notifier = notifiers.swap_remove(pick);

        self.engine.background().spawn("cache.preload", async move {
            if let Err(e) = notifier.notify_cache_miss(&descriptor).await {
                tracing::warn!(error = %e, key = %descriptor.key, "Preload announcement failed");
            }
        });

        Ok(value)
    }
}
