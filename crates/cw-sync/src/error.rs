//! Error taxonomy of the sync layer.

use cw_client_api::ClientApiError;
use cw_sync_contract::{ApiContractError, ResourceKey};

/// Errors surfaced by sync-layer operations.
///
/// Transport failures (`SubscriptionFailed`, `ConnectionLost`) are recovered
/// locally by polling and only ever shown as a banner. Everything else is
/// returned to the caller that started the operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to subscribe to {channel}: {message}")]
    SubscriptionFailed { channel: String, message: String },

    #[error("Connection to {channel} lost")]
    ConnectionLost { channel: String },

    #[error("A mutation on {key} is already in flight")]
    MutationConflict { key: ResourceKey },

    #[error("Remote call failed: {0}")]
    RemoteCallFailed(#[from] ClientApiError),

    #[error("Undo token {token} has expired")]
    UndoExpired { token: String },

    #[error("Undo token {token} was already used")]
    UndoAlreadyUsed { token: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Suggestion {id} is already {state}, cannot {action}")]
    InvalidTransition {
        id: String,
        state: String,
        action: String,
    },
}

impl SyncError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage(message.into())
    }

    pub fn conflict(key: &ResourceKey) -> Self {
        Self::MutationConflict { key: key.clone() }
    }

    /// Channel-level failures handled by the polling fallback
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::SubscriptionFailed { .. } | SyncError::ConnectionLost { .. }
        )
    }

    /// Short text suitable for a notification or banner.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::SubscriptionFailed { .. } | SyncError::ConnectionLost { .. } => {
                "Live updates are unavailable. Refreshing periodically.".to_string()
            }
            SyncError::MutationConflict { .. } => {
                "Another change to this item is still being saved. Try again in a moment."
                    .to_string()
            }
            SyncError::RemoteCallFailed(ClientApiError::Rejected { message, .. }) => {
                message.clone()
            }
            SyncError::RemoteCallFailed(_) => {
                "The change could not be saved and has been reverted.".to_string()
            }
            SyncError::UndoExpired { .. } => "This action can no longer be undone.".to_string(),
            SyncError::UndoAlreadyUsed { .. } => "This action was already undone.".to_string(),
            SyncError::Validation(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ApiContractError> for SyncError {
    fn from(err: ApiContractError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<cw_local_db::Error> for SyncError {
    fn from(err: cw_local_db::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
