//! Error types for the data store client

use cw_client_api::ClientApiError;
use cw_sync_contract::RpcErrorBody;
use reqwest::StatusCode;
use thiserror::Error;

/// Errors that can occur when talking to the data store
#[derive(Debug, Error)]
pub enum RestClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Server returned error status {status}: {}", .body.message)]
    ServerError { status: StatusCode, body: RpcErrorBody },

    #[error("Unexpected response format: {0}")]
    UnexpectedResponse(String),

    #[error("Unsupported resource key: {0}")]
    UnsupportedKey(String),

    #[error("Realtime stream error: {0}")]
    Realtime(String),
}

/// Result type alias for client operations
pub type RestClientResult<T> = Result<T, RestClientError>;

impl From<RestClientError> for ClientApiError {
    fn from(err: RestClientError) -> Self {
        match err {
            RestClientError::ServerError { body, status } => match body.code {
                Some(code) => ClientApiError::Rejected {
                    code,
                    message: body.message,
                },
                None => ClientApiError::Server(format!("{}: {}", status, body.message)),
            },
            RestClientError::Http(e) => ClientApiError::Transport(e.to_string()),
            RestClientError::Realtime(e) => ClientApiError::Transport(e),
            other => ClientApiError::Unexpected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coded_server_error_maps_to_rejection() {
        let err = RestClientError::ServerError {
            status: StatusCode::CONFLICT,
            body: RpcErrorBody {
                code: Some("undo_expired".to_string()),
                message: "token expired".to_string(),
                details: None,
                hint: None,
            },
        };

        let api_err: ClientApiError = err.into();
        assert_eq!(api_err.code(), Some("undo_expired"));
    }

    #[test]
    fn test_uncoded_server_error_maps_to_server() {
        let err = RestClientError::ServerError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: RpcErrorBody {
                code: None,
                message: "boom".to_string(),
                details: None,
                hint: None,
            },
        };

        assert!(matches!(ClientApiError::from(err), ClientApiError::Server(_)));
    }
}
