//! Companion for a process that shares its cache with nobody.

use std::sync::Arc;

use async_trait::async_trait;
use cachet_core::LocationId;

use super::traits::{ActiveCacheLocation, CacheCompanion, CacheEventNotifier, PassiveCacheLocation};

/// No peers, no passive stores, no notifiers.
#[derive(Debug, Clone)]
pub struct LocalCacheCompanion {
    self_id: LocationId,
}

impl LocalCacheCompanion {
    pub fn new() -> Self {
        Self {
            self_id: LocationId::local_self(),
        }
    }
}

impl Default for LocalCacheCompanion {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheCompanion for LocalCacheCompanion {
    fn self_location_id(&self) -> &LocationId {
        &self.self_id
    }

    fn passive_locations(&self) -> Vec<Arc<dyn PassiveCacheLocation>> {
        Vec::new()
    }

    async fn get_active_locations(&self, _ids: &[LocationId]) -> Vec<Arc<dyn ActiveCacheLocation>> {
        Vec::new()
    }

    async fn get_all_event_notifiers(&self) -> Vec<Arc<dyn CacheEventNotifier>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::LOCAL_SELF_ID;

    #[tokio::test]
    async fn test_local_companion_is_empty() {
        let companion = LocalCacheCompanion::new();
        assert_eq!(companion.self_location_id().as_str(), LOCAL_SELF_ID);
        assert!(companion.passive_locations().is_empty());
        assert!(companion.get_active_locations(&["peer".into()]).await.is_empty());
        assert!(companion.get_all_event_notifiers().await.is_empty());
    }
}
