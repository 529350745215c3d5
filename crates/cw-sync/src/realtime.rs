//! Live channels: subscription, health, polling fallback and invalidation
//! wired together.

use cw_client_api::{ChangeFeed, FeedStream};
use cw_sync_contract::{ChannelStatus, RealtimeMessage, ResourceKey};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::QueryCache;
use crate::config::PollingConfig;
use crate::dispatcher::{CacheInvalidationDispatcher, InvalidationCallback};
use crate::health::{ConnectionHealthTracker, ConnectionState};
use crate::polling::PollingFallbackScheduler;
use crate::scheduler::Scheduler;
use crate::subscription::ChannelSubscription;
use crate::telemetry::{TelemetrySink, CHANNEL_SUBSCRIBED};
use crate::SyncError;

struct ChannelInner {
    subscription: ChannelSubscription,
    tracker: ConnectionHealthTracker,
    polling: PollingFallbackScheduler,
    dispatcher: CacheInvalidationDispatcher,
    cancel: CancellationToken,
    last_error: Mutex<Option<SyncError>>,
}

/// Handle to one live subscription
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn name(&self) -> &str {
        self.inner.subscription.name()
    }

    pub fn subscription(&self) -> &ChannelSubscription {
        &self.inner.subscription
    }

    pub fn is_inert(&self) -> bool {
        self.inner.subscription.is_inert()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.tracker.state()
    }

    pub fn observe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.tracker.observe()
    }

    /// Wait until the connection state satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> ConnectionState
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.observe();
        let matched = match rx.wait_for(|state| predicate(state)).await {
            Ok(state) => state.clone(),
            // The tracker lives as long as this handle
            Err(_) => self.state(),
        };
        matched
    }

    pub fn is_polling(&self) -> bool {
        self.inner.polling.is_polling()
    }

    /// Polling refreshes triggered so far
    pub fn refresh_count(&self) -> u64 {
        self.inner.polling.fire_count()
    }

    /// Change events that invalidated the cache so far
    pub fn dispatch_count(&self) -> u64 {
        self.inner.dispatcher.dispatch_count()
    }

    /// Why the channel could not be opened, if it could not
    pub fn last_error(&self) -> Option<SyncError> {
        self.lock_error().clone()
    }

    /// Informational banner text while live updates are unavailable
    pub fn banner(&self) -> Option<String> {
        if self.is_inert() || self.is_torn_down() || self.state().is_connected {
            return None;
        }
        let error = self.last_error().unwrap_or_else(|| SyncError::ConnectionLost {
            channel: self.name().to_string(),
        });
        Some(error.user_message())
    }

    /// Stop polling, detach the listener and close the transport. Later
    /// events and timer fires are ignored.
    pub fn teardown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.polling.teardown();
        self.inner.dispatcher.detach();
        info!(channel = %self.name(), "channel torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn lock_error(&self) -> MutexGuard<'_, Option<SyncError>> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_status(&self, status: ChannelStatus) {
        let state = self.inner.tracker.on_status(status);
        self.inner.polling.on_state(&state);
    }

    fn spawn_listener(&self, mut stream: FeedStream) {
        let channel = self.clone();
        let cancel = self.inner.cancel.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    message = stream.recv() => message,
                };

                match message {
                    Some(RealtimeMessage::Status { status }) => channel.on_status(status),
                    Some(RealtimeMessage::Change(event)) => {
                        channel.inner.dispatcher.dispatch(&event);
                    }
                    None => {
                        warn!(channel = %channel.name(), "change feed ended");
                        channel.on_status(ChannelStatus::Closed);
                        break;
                    }
                }
            }
            debug!(channel = %channel.name(), "listener stopped");
        });
    }
}

/// Owns the live channels of one client, at most one per name
#[derive(Clone)]
pub struct RealtimeHub {
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache,
    telemetry: Arc<dyn TelemetrySink>,
    scheduler: Arc<dyn Scheduler>,
    polling: PollingConfig,
    channels: Arc<Mutex<HashMap<String, RealtimeChannel>>>,
}

impl RealtimeHub {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        cache: QueryCache,
        telemetry: Arc<dyn TelemetrySink>,
        scheduler: Arc<dyn Scheduler>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            feed,
            cache,
            telemetry,
            scheduler,
            polling,
            channels: Arc::default(),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, RealtimeChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open `subscription`, invalidating `keys` on every change event and
    /// polling them while disconnected. Replaces a live channel of the same
    /// name, including one still opening. Transport failures degrade to
    /// polling instead of failing.
    pub async fn subscribe(
        &self,
        subscription: ChannelSubscription,
        keys: Vec<ResourceKey>,
        callback: Option<InvalidationCallback>,
    ) -> RealtimeChannel {
        let name = subscription.name().to_string();
        let tracker = ConnectionHealthTracker::new(
            name.clone(),
            self.telemetry.clone(),
            self.scheduler.clone(),
        );
        let polling = PollingFallbackScheduler::new(
            &self.polling,
            keys.clone(),
            Arc::new(self.cache.clone()),
            self.scheduler.clone(),
            tracker.clone(),
        );
        let mut dispatcher =
            CacheInvalidationDispatcher::new(subscription.clone(), keys, self.cache.clone());
        if let Some(callback) = callback {
            dispatcher = dispatcher.with_callback(callback);
        }

        let channel = RealtimeChannel {
            inner: Arc::new(ChannelInner {
                subscription,
                tracker,
                polling,
                dispatcher,
                cancel: CancellationToken::new(),
                last_error: Mutex::new(None),
            }),
        };

        // Claim the name before opening so a concurrent subscribe replaces
        // this channel instead of racing it
        let previous = self.channels().insert(name.clone(), channel.clone());
        if let Some(previous) = previous {
            debug!(channel = %name, "replacing live channel");
            previous.teardown();
        }

        if !channel.is_inert() {
            self.telemetry.track(
                CHANNEL_SUBSCRIBED,
                json!({
                    "channel": name,
                    "changeFilterCount": channel.subscription().change_filters().len(),
                }),
            );
            // Poll until the transport reports SUBSCRIBED
            channel.inner.polling.on_state(&channel.state());

            match channel.subscription().open(self.feed.as_ref()).await {
                Ok(Some(_)) if channel.is_torn_down() => {
                    debug!(channel = %name, "replaced while opening, closing stream");
                }
                Ok(Some(stream)) => channel.spawn_listener(stream),
                Ok(None) => {}
                Err(_) if channel.is_torn_down() => {}
                Err(err) => {
                    warn!(channel = %name, error = %err, "subscription failed, polling instead");
                    *channel.lock_error() = Some(err);
                    channel.on_status(ChannelStatus::ChannelError);
                }
            }
        }

        channel
    }

    pub fn channel(&self, name: &str) -> Option<RealtimeChannel> {
        self.channels()
            .get(name)
            .filter(|c| !c.is_torn_down())
            .cloned()
    }

    /// Number of channels that have not been torn down
    pub fn channel_count(&self) -> usize {
        let mut channels = self.channels();
        channels.retain(|_, c| !c.is_torn_down());
        channels.len()
    }

    pub fn teardown(&self, name: &str) -> bool {
        match self.channels().remove(name) {
            Some(channel) => {
                channel.teardown();
                true
            }
            None => false,
        }
    }

    pub fn teardown_all(&self) {
        let channels: Vec<_> = self.channels().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::telemetry::MemoryTelemetry;
    use cw_rest_client_mock::MockChangeFeed;
    use cw_sync_contract::{ChangeEvent, ChangeEventKind};
    use std::time::Duration;

    struct Fixture {
        feed: MockChangeFeed,
        scheduler: ManualScheduler,
        telemetry: Arc<MemoryTelemetry>,
        hub: RealtimeHub,
    }

    fn fixture() -> Fixture {
        let feed = MockChangeFeed::new();
        let scheduler = ManualScheduler::new();
        let telemetry = Arc::new(MemoryTelemetry::new());
        let hub = RealtimeHub::new(
            Arc::new(feed.clone()),
            QueryCache::new(),
            telemetry.clone(),
            Arc::new(scheduler.clone()),
            PollingConfig::default(),
        );
        Fixture {
            feed,
            scheduler,
            telemetry,
            hub,
        }
    }

    fn tasks(company: Option<&str>) -> ChannelSubscription {
        ChannelSubscription::company_resource(company, "tasks", &["tasks"]).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_tracks_and_connects() {
        let f = fixture();
        let channel = f
            .hub
            .subscribe(tasks(Some("c1")), vec![ResourceKey::tasks("c1")], None)
            .await;

        let subscribed = f.telemetry.named(CHANNEL_SUBSCRIBED);
        assert_eq!(subscribed[0]["channel"], "company:c1:tasks");
        assert_eq!(subscribed[0]["changeFilterCount"], 1);
        assert!(channel.is_polling());
        assert!(channel.banner().is_some());

        f.feed
            .push_status("company:c1:tasks", ChannelStatus::Subscribed)
            .await;
        let state = channel.wait_for(|s| s.is_connected).await;
        assert_eq!(state.attempts, 0);
        assert!(!state.is_polling);
        assert!(channel.banner().is_none());
    }

    #[tokio::test]
    async fn test_inert_channel_never_connects() {
        let f = fixture();
        let channel = f
            .hub
            .subscribe(tasks(None), vec![ResourceKey::tasks("c1")], None)
            .await;

        f.scheduler.advance(Duration::from_secs(300));
        assert!(channel.is_inert());
        assert!(!channel.is_polling());
        assert_eq!(channel.refresh_count(), 0);
        assert!(channel.banner().is_none());
        assert!(f.telemetry.named(CHANNEL_SUBSCRIBED).is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_falls_back_to_polling() {
        let f = fixture();
        f.feed.set_fail_open(true);

        let channel = f
            .hub
            .subscribe(tasks(Some("c1")), vec![ResourceKey::tasks("c1")], None)
            .await;

        assert!(matches!(
            channel.last_error(),
            Some(SyncError::SubscriptionFailed { .. })
        ));
        assert_eq!(channel.state().attempts, 1);
        f.scheduler.advance(Duration::from_secs(30));
        assert_eq!(channel.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_channel() {
        let f = fixture();
        let first = f
            .hub
            .subscribe(tasks(Some("c1")), vec![ResourceKey::tasks("c1")], None)
            .await;
        let second = f
            .hub
            .subscribe(tasks(Some("c1")), vec![ResourceKey::tasks("c1")], None)
            .await;

        assert!(first.is_torn_down());
        assert!(!second.is_torn_down());
        assert_eq!(f.hub.channel_count(), 1);
        assert_eq!(f.feed.open_count("company:c1:tasks"), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_restarts_polling_interval() {
        let f = fixture();
        let keys = vec![ResourceKey::tasks("c1")];
        let first = f.hub.subscribe(tasks(Some("c1")), keys.clone(), None).await;

        f.scheduler.advance(Duration::from_secs(20));
        let second = f.hub.subscribe(tasks(Some("c1")), keys, None).await;

        f.scheduler.advance(Duration::from_secs(20));
        assert_eq!(first.refresh_count(), 0);
        assert_eq!(second.refresh_count(), 0);

        f.scheduler.advance(Duration::from_secs(10));
        assert_eq!(first.refresh_count(), 0);
        assert_eq!(second.refresh_count(), 1);
        assert_eq!(f.scheduler.pending(), 1);
    }

    /// Feed that yields before opening so two subscribes interleave
    struct YieldingFeed(MockChangeFeed);

    #[async_trait::async_trait]
    impl ChangeFeed for YieldingFeed {
        async fn open(
            &self,
            channel: &str,
            filters: &[cw_sync_contract::ChangeFilter],
        ) -> cw_client_api::ClientApiResult<FeedStream> {
            tokio::task::yield_now().await;
            self.0.open(channel, filters).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_keep_one_channel() {
        let feed = MockChangeFeed::new();
        let scheduler = ManualScheduler::new();
        let hub = RealtimeHub::new(
            Arc::new(YieldingFeed(feed.clone())),
            QueryCache::new(),
            Arc::new(MemoryTelemetry::new()),
            Arc::new(scheduler.clone()),
            PollingConfig::default(),
        );
        let keys = vec![ResourceKey::tasks("c1")];

        let (a, b) = tokio::join!(
            hub.subscribe(tasks(Some("c1")), keys.clone(), None),
            hub.subscribe(tasks(Some("c1")), keys.clone(), None),
        );

        assert_eq!(hub.channel_count(), 1);
        assert!(a.is_torn_down() != b.is_torn_down());
        let live = if a.is_torn_down() { &b } else { &a };
        assert!(hub.channel("company:c1:tasks").is_some());

        scheduler.advance(Duration::from_secs(30));
        assert_eq!(a.refresh_count() + b.refresh_count(), 1);
        assert_eq!(live.refresh_count(), 1);
        assert_eq!(scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_events_after_teardown_are_ignored() {
        let f = fixture();
        let channel = f
            .hub
            .subscribe(tasks(Some("c1")), vec![ResourceKey::tasks("c1")], None)
            .await;

        assert!(f.hub.teardown("company:c1:tasks"));
        f.feed
            .push_change(
                "company:c1:tasks",
                ChangeEvent::new(ChangeEventKind::Insert, "tasks"),
            )
            .await;
        f.scheduler.advance(Duration::from_secs(120));
        tokio::task::yield_now().await;

        assert_eq!(channel.dispatch_count(), 0);
        assert_eq!(channel.refresh_count(), 0);
        assert_eq!(f.hub.channel_count(), 0);
        assert_eq!(f.scheduler.pending(), 0);
    }
}
