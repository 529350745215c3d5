//! Validation helpers for contract types

use crate::error::ApiContractError;
use crate::types::*;
use std::collections::HashSet;
use validator::Validate;

/// Prefix shared by every company-scoped channel name
pub const CHANNEL_PREFIX: &str = "company";

/// Build the channel name `company:{company_id}:{resource}`
pub fn channel_name(company_id: &str, resource: &str) -> String {
    format!("{}:{}:{}", CHANNEL_PREFIX, company_id, resource)
}

/// Validate a channel name of the form `company:{company_id}:{resource}`
pub fn validate_channel_name(name: &str) -> Result<(), ApiContractError> {
    let mut parts = name.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(CHANNEL_PREFIX), Some(company), Some(resource), None)
            if !company.is_empty() && !resource.is_empty() =>
        {
            Ok(())
        }
        _ => Err(ApiContractError::InvalidChannelName(name.to_string())),
    }
}

/// Validate a change filter
pub fn validate_change_filter(filter: &ChangeFilter) -> Result<(), ApiContractError> {
    filter.validate()?;
    Ok(())
}

/// Validate a claim request
pub fn validate_claim_request(request: &ClaimTaskRequest) -> Result<(), ApiContractError> {
    request.validate()?;
    Ok(())
}

/// Validate an assign request
pub fn validate_assign_request(request: &AssignTaskRequest) -> Result<(), ApiContractError> {
    request.validate()?;
    Ok(())
}

/// Validate a complete request
pub fn validate_complete_request(request: &CompleteTaskRequest) -> Result<(), ApiContractError> {
    request.validate()?;
    Ok(())
}

/// Validate an undo request
pub fn validate_undo_request(request: &UndoTaskRequest) -> Result<(), ApiContractError> {
    request.validate()?;
    Ok(())
}

/// Validate an undo-combine request
pub fn validate_undo_combine_request(request: &UndoCombineRequest) -> Result<(), ApiContractError> {
    request.validate()?;
    Ok(())
}

/// Validate a combine request: at least two distinct, non-empty task ids
pub fn validate_combine_request(request: &CombineTasksRequest) -> Result<(), ApiContractError> {
    request.validate()?;

    let mut seen = HashSet::new();
    for id in &request.task_ids {
        if id.is_empty() {
            return Err(ApiContractError::InvalidCombination(
                "task ids cannot be empty".to_string(),
            ));
        }
        if !seen.insert(id.as_str()) {
            return Err(ApiContractError::InvalidCombination(format!(
                "task {} listed twice",
                id
            )));
        }
    }

    Ok(())
}

/// Validate a combination suggestion
pub fn validate_suggestion(suggestion: &CombinationSuggestion) -> Result<(), ApiContractError> {
    suggestion.validate()?;

    // NaN slips through range checks
    if !suggestion.similarity_score.is_finite() {
        return Err(ApiContractError::InvalidCombination(format!(
            "similarity score of {} is not a number",
            suggestion.id
        )));
    }
    if suggestion.base_task_id == suggestion.suggested_task_id {
        return Err(ApiContractError::InvalidCombination(format!(
            "suggestion {} combines task {} with itself",
            suggestion.id, suggestion.base_task_id
        )));
    }

    Ok(())
}

/// Validate a resource key: non-empty with non-empty segments
pub fn validate_resource_key(key: &ResourceKey) -> Result<(), ApiContractError> {
    if key.is_empty() || key.parts().iter().any(String::is_empty) {
        return Err(ApiContractError::InvalidResourceKey(key.to_string()));
    }
    Ok(())
}
