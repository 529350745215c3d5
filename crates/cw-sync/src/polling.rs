//! Time-based refresh while a realtime channel is down.

use cw_sync_contract::ResourceKey;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::PollingConfig;
use crate::health::{ConnectionHealthTracker, ConnectionState};
use crate::scheduler::{CancelHandle, Scheduler};

/// Receives the keys to refresh on every poll
pub trait RefreshSink: Send + Sync {
    fn refresh(&self, keys: &[ResourceKey]);
}

struct PollingInner {
    enabled: bool,
    interval: Duration,
    keys: Vec<ResourceKey>,
    sink: Arc<dyn RefreshSink>,
    scheduler: Arc<dyn Scheduler>,
    tracker: ConnectionHealthTracker,
    timer: Option<CancelHandle>,
    /// Bumped on every start/stop so a timer armed earlier can tell it is stale
    generation: u64,
    torn_down: bool,
    fires: u64,
}

/// Refreshes a fixed set of cache keys on an interval while the channel it
/// follows is disconnected.
///
/// The timer is cancelled synchronously when a connected state is observed,
/// so no refresh fires after reconnection.
#[derive(Clone)]
pub struct PollingFallbackScheduler {
    inner: Arc<Mutex<PollingInner>>,
}

impl PollingFallbackScheduler {
    pub fn new(
        config: &PollingConfig,
        keys: Vec<ResourceKey>,
        sink: Arc<dyn RefreshSink>,
        scheduler: Arc<dyn Scheduler>,
        tracker: ConnectionHealthTracker,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PollingInner {
                enabled: config.enabled,
                interval: config.interval(),
                keys,
                sink,
                scheduler,
                tracker,
                timer: None,
                generation: 0,
                torn_down: false,
                fires: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PollingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start or stop polling to match `state`
    pub fn on_state(&self, state: &ConnectionState) {
        let mut inner = self.lock();
        if inner.torn_down {
            return;
        }

        if state.is_connected || !inner.enabled {
            Self::stop(&mut inner);
        } else if inner.timer.is_none() {
            info!(
                channel = %inner.tracker.channel(),
                interval_ms = inner.interval.as_millis() as u64,
                "falling back to polling"
            );
            inner.generation += 1;
            Self::arm(&self.inner, &mut inner);
            inner.tracker.set_polling(true);
        }
    }

    /// Stop for good. Later timer fires and state updates are ignored.
    pub fn teardown(&self) {
        let mut inner = self.lock();
        Self::stop(&mut inner);
        inner.torn_down = true;
    }

    pub fn is_polling(&self) -> bool {
        self.lock().timer.is_some()
    }

    /// Number of refreshes triggered so far
    pub fn fire_count(&self) -> u64 {
        self.lock().fires
    }

    fn stop(inner: &mut PollingInner) {
        if let Some(timer) = inner.timer.take() {
            timer.cancel();
            inner.generation += 1;
            debug!(channel = %inner.tracker.channel(), "polling stopped");
        }
        inner.tracker.set_polling(false);
    }

    fn arm(shared: &Arc<Mutex<PollingInner>>, inner: &mut PollingInner) {
        let weak = Arc::downgrade(shared);
        let generation = inner.generation;
        let handle = inner
            .scheduler
            .after(inner.interval, Box::new(move || Self::tick(weak, generation)));
        inner.timer = Some(handle);
    }

    fn tick(weak: Weak<Mutex<PollingInner>>, generation: u64) {
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let (sink, keys) = {
            let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.torn_down || inner.timer.is_none() || inner.generation != generation {
                return;
            }
            inner.fires += 1;
            debug!(channel = %inner.tracker.channel(), fires = inner.fires, "polling refresh");
            Self::arm(&shared, &mut inner);
            (inner.sink.clone(), inner.keys.clone())
        };

        sink.refresh(&keys);
    }
}
