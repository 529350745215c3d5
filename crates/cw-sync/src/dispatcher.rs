//! Change events to cache invalidations.

use cw_sync_contract::{ChangeEvent, ResourceKey};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::cache::QueryCache;
use crate::subscription::ChannelSubscription;

pub type InvalidationCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Invalidates every registered key on every change event of one
/// subscription. Payloads are never inspected: any change means the
/// resource may be stale and must be refetched.
pub struct CacheInvalidationDispatcher {
    subscription: ChannelSubscription,
    keys: Vec<ResourceKey>,
    cache: QueryCache,
    callback: Option<InvalidationCallback>,
    detached: AtomicBool,
    dispatched: AtomicU64,
}

impl CacheInvalidationDispatcher {
    pub fn new(subscription: ChannelSubscription, keys: Vec<ResourceKey>, cache: QueryCache) -> Self {
        Self {
            subscription,
            keys,
            cache,
            callback: None,
            detached: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Also run `callback` for every dispatched event
    pub fn with_callback(mut self, callback: InvalidationCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn subscription(&self) -> &ChannelSubscription {
        &self.subscription
    }

    pub fn keys(&self) -> &[ResourceKey] {
        &self.keys
    }

    /// Invalidate all registered keys. Returns false once detached.
    pub fn dispatch(&self, event: &ChangeEvent) -> bool {
        if self.detached.load(Ordering::SeqCst) {
            debug!(channel = %self.subscription.name(), "event after teardown dropped");
            return false;
        }

        debug!(
            channel = %self.subscription.name(),
            event = %event.event,
            table = %event.table,
            keys = self.keys.len(),
            "invalidating"
        );
        for key in &self.keys {
            self.cache.invalidate(key);
        }
        if let Some(callback) = &self.callback {
            callback(event);
        }
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Stop reacting to events
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_rest_client_mock::MockBackend;
    use cw_sync_contract::ChangeEventKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn hydrated_cache() -> QueryCache {
        let backend = MockBackend::new();
        backend.insert_task("c1", "t1", json!({}));
        backend.insert_row(ResourceKey::new(["recipes", "c1"]), json!([]));
        let cache = QueryCache::new();
        for key in [
            ResourceKey::tasks("c1"),
            ResourceKey::task("c1", "t1"),
            ResourceKey::new(["recipes", "c1"]),
        ] {
            cache.refetch(&backend, &key).await.unwrap();
        }
        cache
    }

    fn subscription() -> ChannelSubscription {
        ChannelSubscription::company_resource(Some("c1"), "tasks", &["tasks"]).unwrap()
    }

    #[tokio::test]
    async fn test_any_event_invalidates_all_keys() {
        let cache = hydrated_cache().await;
        let dispatcher = CacheInvalidationDispatcher::new(
            subscription(),
            vec![ResourceKey::tasks("c1"), ResourceKey::new(["recipes", "c1"])],
            cache.clone(),
        );

        // Payload and kind do not matter
        let mut event = ChangeEvent::new(ChangeEventKind::Delete, "tasks");
        event.record = Some(json!({ "id": "unrelated" }));
        assert!(dispatcher.dispatch(&event));

        assert!(cache.is_stale(&ResourceKey::tasks("c1")));
        assert!(cache.is_stale(&ResourceKey::task("c1", "t1")));
        assert!(cache.is_stale(&ResourceKey::new(["recipes", "c1"])));
        assert_eq!(dispatcher.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_callback_runs_per_event() {
        let cache = hydrated_cache().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let dispatcher =
            CacheInvalidationDispatcher::new(subscription(), vec![ResourceKey::tasks("c1")], cache)
                .with_callback({
                    let seen = seen.clone();
                    Arc::new(move |_: &ChangeEvent| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    })
                });

        dispatcher.dispatch(&ChangeEvent::new(ChangeEventKind::Insert, "tasks"));
        dispatcher.dispatch(&ChangeEvent::new(ChangeEventKind::Update, "tasks"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_detached_dispatcher_is_noop() {
        let cache = hydrated_cache().await;
        let dispatcher = CacheInvalidationDispatcher::new(
            subscription(),
            vec![ResourceKey::tasks("c1")],
            cache.clone(),
        );

        dispatcher.detach();
        assert!(!dispatcher.dispatch(&ChangeEvent::new(ChangeEventKind::Update, "tasks")));
        assert!(!cache.is_stale(&ResourceKey::tasks("c1")));
    }
}
