//! Background refetching of invalidated cache entries.

use cw_client_api::RemoteApi;
use cw_sync_contract::ResourceKey;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheEvent, QueryCache};

/// Refetches stale entries whenever the cache reports an invalidation.
/// Stops when shut down or dropped.
pub struct Refetcher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Refetcher {
    pub fn spawn(cache: QueryCache, api: Arc<dyn RemoteApi>) -> Self {
        let cancel = CancellationToken::new();
        let mut events = cache.subscribe();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let prefix = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(CacheEvent::Invalidated(prefix)) => prefix,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "refetcher lagged, refreshing everything stale");
                            ResourceKey::new(Vec::<String>::new())
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                for key in cache.stale_keys(&prefix) {
                    if token.is_cancelled() {
                        break;
                    }
                    if let Err(err) = cache.refetch(api.as_ref(), &key).await {
                        warn!(%key, error = %err, "background refetch failed");
                    }
                }
            }
            debug!("refetcher stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop and wait for an in-flight refetch to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Refetcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_rest_client_mock::MockBackend;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalidation_triggers_refetch() {
        let backend = MockBackend::new();
        backend.insert_task("c1", "t1", json!({ "title": "Prep" }));
        let cache = QueryCache::new();
        let key = ResourceKey::task("c1", "t1");
        cache.refetch(&backend, &key).await.unwrap();

        let refetcher = Refetcher::spawn(cache.clone(), Arc::new(backend.clone()));
        backend.insert_task("c1", "t1", json!({ "title": "Plated" }));
        cache.invalidate(&ResourceKey::tasks("c1"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.data(&key).unwrap()["title"] != "Plated" {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(!cache.is_stale(&key));
        refetcher.shutdown().await;
    }
}
