//! Error types for contract validation and parsing

use thiserror::Error;

/// Errors that can occur during contract validation and parsing
#[derive(Debug, Error)]
pub enum ApiContractError {
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid channel name: {0}")]
    InvalidChannelName(String),

    #[error("Invalid combination: {0}")]
    InvalidCombination(String),

    #[error("Invalid resource key: {0}")]
    InvalidResourceKey(String),
}
