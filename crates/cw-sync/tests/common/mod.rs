//! Shared harness for the sync integration tests.

#![allow(dead_code)]

use cw_rest_client_mock::{MockBackend, MockChangeFeed};
use cw_sync::{
    ConnectionState, ManualScheduler, MemoryTelemetry, RealtimeChannel, SyncClient, SyncConfig,
};
use std::sync::Arc;
use std::time::Duration;

pub const COMPANY: &str = "c1";
pub const ACTOR: &str = "u1";

pub struct Harness {
    pub backend: MockBackend,
    pub feed: MockChangeFeed,
    pub scheduler: ManualScheduler,
    pub telemetry: Arc<MemoryTelemetry>,
    pub client: SyncClient,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        let feed = MockChangeFeed::new();
        let backend = MockBackend::new()
            .with_actor(ACTOR)
            .with_feed(feed.clone());
        let scheduler = ManualScheduler::new();
        let telemetry = Arc::new(MemoryTelemetry::new());

        let client = SyncClient::builder(
            config,
            Arc::new(backend.clone()),
            Arc::new(feed.clone()),
        )
        .scheduler(Arc::new(scheduler.clone()))
        .telemetry(telemetry.clone())
        .build()
        .expect("valid test configuration");

        Self {
            backend,
            feed,
            scheduler,
            telemetry,
            client,
        }
    }

    /// Company `c1`, actor `u1`, default polling
    pub fn standard() -> Self {
        Self::new(SyncConfig::default().with_company(COMPANY).with_actor(ACTOR))
    }
}

/// Let spawned listener and refetch tasks run to quiescence
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Wait up to two seconds for `check` to hold
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Wait up to two seconds for the channel state to satisfy `predicate`
pub async fn wait_state<F>(channel: &RealtimeChannel, predicate: F) -> ConnectionState
where
    F: FnMut(&ConnectionState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), channel.wait_for(predicate))
        .await
        .expect("connection state never matched")
}
