//! Remote authority traits consumed by the sync core
//!
//! The remote data store is reachable through three interfaces: a query
//! interface (`RemoteApi::fetch`), a remote-procedure interface (the task and
//! combination RPCs) and a change-feed interface (`ChangeFeed`).

use async_trait::async_trait;
use cw_sync_contract::*;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error)]
pub enum ClientApiError {
    #[error("server error: {0}")]
    Server(String),
    #[error("rejected by server ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl ClientApiError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The backend rejection code, if the server rejected the call
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientApiError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub type ClientApiResult<T> = Result<T, ClientApiError>;

/// Query and remote-procedure surface of the data store
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Read the current server value of a cache key
    async fn fetch(&self, key: &ResourceKey) -> ClientApiResult<serde_json::Value>;

    async fn claim_task(&self, request: &ClaimTaskRequest) -> ClientApiResult<TaskActionResponse>;
    async fn assign_task(&self, request: &AssignTaskRequest)
        -> ClientApiResult<TaskActionResponse>;
    async fn complete_task(
        &self,
        request: &CompleteTaskRequest,
    ) -> ClientApiResult<TaskActionResponse>;
    async fn undo_task(&self, request: &UndoTaskRequest) -> ClientApiResult<TaskActionResponse>;

    async fn combine_tasks(
        &self,
        request: &CombineTasksRequest,
    ) -> ClientApiResult<CombineTasksResponse>;
    async fn undo_combine(&self, request: &UndoCombineRequest)
        -> ClientApiResult<TaskActionResponse>;

    async fn list_suggestions(&self, company_id: &str)
        -> ClientApiResult<Vec<CombinationSuggestion>>;
    async fn delete_suggestion(&self, suggestion_id: &str) -> ClientApiResult<()>;

    async fn append_audit(&self, record: &AuditRecord) -> ClientApiResult<()>;
}

/// Change-feed surface of the data store.
///
/// The transport owns reconnection and backoff; it reports every status
/// transition through the returned stream.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn open(&self, channel: &str, filters: &[ChangeFilter]) -> ClientApiResult<FeedStream>;
}

/// Sending half handed to the transport task
pub type FeedSender = mpsc::Sender<RealtimeMessage>;

/// Receiving half of one open channel
pub struct FeedStream {
    receiver: mpsc::Receiver<RealtimeMessage>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedStream {
    pub fn channel(buffer: usize) -> (FeedSender, FeedStream) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            tx,
            FeedStream {
                receiver: rx,
                on_close: None,
            },
        )
    }

    /// Run `f` when the stream is dropped, e.g. to stop a transport task
    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Next message; `None` once the transport has gone away for good
    pub async fn recv(&mut self) -> Option<RealtimeMessage> {
        self.receiver.recv().await
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

impl std::fmt::Debug for FeedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedStream").finish_non_exhaustive()
    }
}
