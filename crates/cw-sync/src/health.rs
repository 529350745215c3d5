//! Connection health of one realtime channel.

use chrono::{DateTime, Utc};
use cw_sync_contract::ChannelStatus;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::scheduler::Scheduler;
use crate::telemetry::{TelemetrySink, CONNECTION_STATUS};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub is_connected: bool,
    /// Non-`SUBSCRIBED` statuses seen since the channel was last connected
    pub attempts: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub is_polling: bool,
}

/// Folds transport statuses into a [`ConnectionState`].
///
/// Observes only: retrying and backoff belong to the transport. Every status
/// is applied in delivery order and reported to telemetry.
#[derive(Clone)]
pub struct ConnectionHealthTracker {
    channel: String,
    state: Arc<watch::Sender<ConnectionState>>,
    telemetry: Arc<dyn TelemetrySink>,
    scheduler: Arc<dyn Scheduler>,
}

impl ConnectionHealthTracker {
    pub fn new(
        channel: impl Into<String>,
        telemetry: Arc<dyn TelemetrySink>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            channel: channel.into(),
            state: Arc::new(state),
            telemetry,
            scheduler,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn observe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Apply one transport status and return the resulting state
    pub fn on_status(&self, status: ChannelStatus) -> ConnectionState {
        let now = self.scheduler.now();
        let mut was_connected = false;

        self.state.send_modify(|state| {
            was_connected = state.is_connected;
            if status.is_connected() {
                state.is_connected = true;
                state.attempts = 0;
                state.last_connected_at = Some(now);
            } else {
                state.is_connected = false;
                state.attempts = state.attempts.saturating_add(1);
            }
        });
        let state = self.state();

        match (was_connected, state.is_connected) {
            (false, true) => info!(channel = %self.channel, "realtime channel connected"),
            (true, false) => {
                info!(channel = %self.channel, %status, "realtime channel lost")
            }
            _ => debug!(channel = %self.channel, %status, attempts = state.attempts, "channel status"),
        }

        self.telemetry.track(
            CONNECTION_STATUS,
            json!({
                "channel": self.channel,
                "status": status.as_str(),
                "attempts": state.attempts,
            }),
        );

        state
    }

    pub(crate) fn set_polling(&self, polling: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_polling != polling;
            state.is_polling = polling;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::telemetry::MemoryTelemetry;
    use std::time::Duration;

    fn tracker() -> (ConnectionHealthTracker, Arc<MemoryTelemetry>, ManualScheduler) {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let scheduler = ManualScheduler::new();
        let tracker = ConnectionHealthTracker::new(
            "company:c1:tasks",
            telemetry.clone(),
            Arc::new(scheduler.clone()),
        );
        (tracker, telemetry, scheduler)
    }

    #[test]
    fn test_starts_disconnected() {
        let (tracker, _, _) = tracker();
        assert_eq!(tracker.state(), ConnectionState::default());
    }

    #[test]
    fn test_attempts_accounting() {
        let (tracker, _, _) = tracker();
        let sequence = [
            ChannelStatus::TimedOut,
            ChannelStatus::ChannelError,
            ChannelStatus::Subscribed,
            ChannelStatus::Closed,
            ChannelStatus::Closed,
            ChannelStatus::Subscribed,
            ChannelStatus::Subscribed,
            ChannelStatus::TimedOut,
        ];

        let mut expected = 0u32;
        for status in sequence {
            let state = tracker.on_status(status);
            if status == ChannelStatus::Subscribed {
                expected = 0;
            } else {
                expected += 1;
            }
            assert_eq!(state.attempts, expected, "after {}", status);
            assert_eq!(state.is_connected, status == ChannelStatus::Subscribed);
        }
    }

    #[test]
    fn test_reconnect_stamps_last_connected() {
        let (tracker, _, scheduler) = tracker();
        tracker.on_status(ChannelStatus::Subscribed);
        let first = tracker.state().last_connected_at.unwrap();

        tracker.on_status(ChannelStatus::Closed);
        scheduler.advance(Duration::from_secs(60));
        let state = tracker.on_status(ChannelStatus::Subscribed);

        assert_eq!(
            state.last_connected_at.unwrap() - first,
            chrono::Duration::seconds(60)
        );
    }

    #[test]
    fn test_every_transition_is_tracked() {
        let (tracker, telemetry, _) = tracker();
        tracker.on_status(ChannelStatus::Subscribed);
        tracker.on_status(ChannelStatus::Closed);

        let events = telemetry.named(CONNECTION_STATUS);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["channel"], "company:c1:tasks");
        assert_eq!(events[1]["status"], "CLOSED");
        assert_eq!(events[1]["attempts"], 1);
    }

    #[tokio::test]
    async fn test_observers_see_latest_state() {
        let (tracker, _, _) = tracker();
        let mut rx = tracker.observe();

        tracker.on_status(ChannelStatus::Subscribed);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_connected);
    }
}
