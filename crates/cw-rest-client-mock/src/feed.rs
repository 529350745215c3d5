//! In-memory change feed implementing [`ChangeFeed`]

use async_trait::async_trait;
use cw_client_api::{ChangeFeed, ClientApiError, ClientApiResult, FeedSender, FeedStream};
use cw_sync_contract::{ChangeEvent, ChangeFilter, ChannelStatus, RealtimeMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const FEED_BUFFER: usize = 256;

struct OpenChannel {
    filters: Vec<ChangeFilter>,
    sender: FeedSender,
}

#[derive(Default)]
struct FeedState {
    channels: HashMap<String, OpenChannel>,
    open_count: HashMap<String, usize>,
    fail_open: bool,
}

/// Change feed driven by the test: statuses and change events are pushed
/// explicitly per channel.
#[derive(Clone, Default)]
pub struct MockChangeFeed {
    state: Arc<Mutex<FeedState>>,
}

impl MockChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent `open` calls fail as if the transport were unreachable
    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// How many times `channel` has been opened
    pub fn open_count(&self, channel: &str) -> usize {
        self.state().open_count.get(channel).copied().unwrap_or(0)
    }

    /// Whether a consumer currently holds `channel` open
    pub fn is_open(&self, channel: &str) -> bool {
        self.state()
            .channels
            .get(channel)
            .is_some_and(|open| !open.sender.is_closed())
    }

    pub fn filters(&self, channel: &str) -> Option<Vec<ChangeFilter>> {
        self.state().channels.get(channel).map(|open| open.filters.clone())
    }

    /// Deliver a transport status on `channel`. Returns false when nobody is
    /// listening.
    pub async fn push_status(&self, channel: &str, status: ChannelStatus) -> bool {
        self.send(channel, RealtimeMessage::Status { status }).await
    }

    /// Deliver a change event on `channel` regardless of its filters
    pub async fn push_change(&self, channel: &str, event: ChangeEvent) -> bool {
        self.send(channel, RealtimeMessage::Change(event)).await
    }

    /// Deliver `event` to every open channel with a matching filter
    pub async fn publish(&self, event: ChangeEvent) {
        let senders: Vec<FeedSender> = self
            .state()
            .channels
            .values()
            .filter(|open| open.filters.iter().any(|f| f.accepts(&event)))
            .map(|open| open.sender.clone())
            .collect();

        for sender in senders {
            let _ = sender.send(RealtimeMessage::Change(event.clone())).await;
        }
    }

    /// Drop the transport side of `channel`, ending its stream
    pub fn close(&self, channel: &str) {
        self.state().channels.remove(channel);
    }

    async fn send(&self, channel: &str, message: RealtimeMessage) -> bool {
        let sender = self.state().channels.get(channel).map(|open| open.sender.clone());
        match sender {
            Some(sender) => sender.send(message).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ChangeFeed for MockChangeFeed {
    async fn open(&self, channel: &str, filters: &[ChangeFilter]) -> ClientApiResult<FeedStream> {
        let mut state = self.state();
        if state.fail_open {
            return Err(ClientApiError::Transport(format!(
                "cannot reach realtime endpoint for {}",
                channel
            )));
        }

        let (sender, stream) = FeedStream::channel(FEED_BUFFER);
        state.channels.insert(
            channel.to_string(),
            OpenChannel {
                filters: filters.to_vec(),
                sender,
            },
        );
        *state.open_count.entry(channel.to_string()).or_insert(0) += 1;
        Ok(stream)
    }
}
