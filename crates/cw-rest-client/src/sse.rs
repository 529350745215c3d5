//! Realtime change feed over Server-Sent Events

use async_trait::async_trait;
use cw_client_api::{ChangeFeed, ClientApiResult, FeedSender, FeedStream};
use cw_sync_contract::{ChangeFilter, ChannelStatus, RealtimeMessage};
use eventsource_client as es;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::auth::AuthConfig;
use crate::error::{RestClientError, RestClientResult};

const FEED_BUFFER: usize = 64;

/// Change feed backed by the data store's SSE realtime endpoint.
///
/// Reconnection and backoff are left to the SSE client; each failure is
/// reported to the consumer as a status message.
#[derive(Debug, Clone)]
pub struct SseChangeFeed {
    base_url: Url,
    auth: AuthConfig,
    reconnect_delay: Duration,
    reconnect_delay_max: Duration,
}

impl SseChangeFeed {
    pub fn new(base_url: Url, auth: AuthConfig) -> Self {
        Self {
            base_url,
            auth,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(30),
        }
    }

    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.reconnect_delay_max = max;
        self
    }

    fn channel_url(&self, channel: &str, filters: &[ChangeFilter]) -> RestClientResult<Url> {
        let mut url = self.base_url.join(&format!("/realtime/v1/channels/{}", channel))?;
        let filters = serde_json::to_string(filters)?;
        url.query_pairs_mut().append_pair("filters", &filters);
        Ok(url)
    }

    fn build_client(&self, url: &Url) -> RestClientResult<impl es::Client> {
        let realtime_err = |e: es::Error| RestClientError::Realtime(format!("{:?}", e));

        let mut builder = es::ClientBuilder::for_url(url.as_str()).map_err(realtime_err)?;
        let headers = self.auth.headers().map_err(|e| RestClientError::Auth(e.to_string()))?;
        for (name, value) in headers.iter() {
            let value = value.to_str().map_err(|e| RestClientError::Auth(e.to_string()))?;
            builder = builder.header(name.as_str(), value).map_err(realtime_err)?;
        }

        Ok(builder
            .reconnect(
                es::ReconnectOptions::reconnect(true)
                    .retry_initial(true)
                    .delay(self.reconnect_delay)
                    .backoff_factor(2)
                    .delay_max(self.reconnect_delay_max)
                    .build(),
            )
            .build())
    }
}

#[async_trait]
impl ChangeFeed for SseChangeFeed {
    async fn open(&self, channel: &str, filters: &[ChangeFilter]) -> ClientApiResult<FeedStream> {
        let url = self.channel_url(channel, filters)?;
        let client = self.build_client(&url)?;
        let (tx, stream) = FeedStream::channel(FEED_BUFFER);

        let channel = channel.to_string();
        let handle = tokio::spawn(async move {
            pump(client, channel, tx).await;
        });

        Ok(stream.on_close(move || handle.abort()))
    }
}

async fn pump(client: impl es::Client, channel: String, tx: FeedSender) {
    let mut events = client.stream();

    while let Some(item) = events.next().await {
        let message = match item {
            Ok(es::SSE::Event(event)) => match parse_message(&event.data) {
                Some(message) => message,
                None => {
                    warn!(channel = %channel, event_type = %event.event_type, "dropping malformed realtime frame");
                    continue;
                }
            },
            Ok(_) => continue,
            Err(err) => {
                debug!(channel = %channel, error = ?err, "realtime stream error");
                RealtimeMessage::Status {
                    status: status_for_error(&err),
                }
            }
        };

        if tx.send(message).await.is_err() {
            // Consumer went away
            break;
        }
    }

    let _ = tx
        .send(RealtimeMessage::Status {
            status: ChannelStatus::Closed,
        })
        .await;
}

fn parse_message(data: &str) -> Option<RealtimeMessage> {
    serde_json::from_str(data).ok()
}

fn status_for_error(err: &es::Error) -> ChannelStatus {
    match err {
        es::Error::TimedOut => ChannelStatus::TimedOut,
        es::Error::StreamClosed => ChannelStatus::Closed,
        _ => ChannelStatus::ChannelError,
    }
}
