//! Review of task-combination suggestions.

use cw_client_api::RemoteApi;
use cw_sync_contract::validation::{
    validate_combine_request, validate_suggestion, validate_undo_combine_request,
};
use cw_sync_contract::{
    AuditAction, CombinationSuggestion, CombineTasksRequest, CombineTasksResponse, ResourceKey,
    TaskActionResponse, UndoCombineRequest,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::audit::AuditTrail;
use crate::mutation::OptimisticMutationCoordinator;
use crate::telemetry::{TelemetrySink, SUGGESTION_REVIEWED};
use crate::{Result, SyncError};

const GROUP_ENTITY: &str = "task_combination";
const SUGGESTION_ENTITY: &str = "task_combination_suggestion";
/// Deletes tried per accept before the row is left for the next load
const DELETE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SuggestionStatus::Pending)
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Tracked {
    suggestion: CombinationSuggestion,
    status: SuggestionStatus,
    combined_group_id: Option<String>,
}

#[derive(Default)]
struct ReviewState {
    suggestions: HashMap<String, Tracked>,
    /// Tasks referenced by a review whose RPC has not been confirmed yet
    reserved: HashSet<String>,
    /// Accepted suggestions whose stored row is not deleted yet
    undeleted: HashSet<String>,
}

/// Accepts, rejects and rolls back merge suggestions for one company.
///
/// Every decision is one RPC followed by one audit append. A suggestion
/// leaves `Pending` at most once. While a review is in flight its tasks are
/// reserved, and any other review touching them fails with
/// `MutationConflict`.
#[derive(Clone)]
pub struct CombinationReviewWorkflow {
    company_id: String,
    coordinator: OptimisticMutationCoordinator,
    api: Arc<dyn RemoteApi>,
    audit: AuditTrail,
    telemetry: Arc<dyn TelemetrySink>,
    state: Arc<Mutex<ReviewState>>,
}

impl CombinationReviewWorkflow {
    pub fn new(
        company_id: impl Into<String>,
        coordinator: OptimisticMutationCoordinator,
        api: Arc<dyn RemoteApi>,
        audit: AuditTrail,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            company_id: company_id.into(),
            coordinator,
            api,
            audit,
            telemetry,
            state: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReviewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn company_id(&self) -> &str {
        &self.company_id
    }

    /// Fetch the company's suggestions. Malformed rows are skipped, as are
    /// accepted suggestions whose row could not be deleted yet.
    pub async fn load(&self) -> Result<Vec<CombinationSuggestion>> {
        let undeleted = self.flush_undeleted().await;
        let listed = self.api.list_suggestions(&self.company_id).await?;

        let mut valid = Vec::with_capacity(listed.len());
        for suggestion in listed {
            if undeleted.contains(&suggestion.id) {
                continue;
            }
            match validate_suggestion(&suggestion) {
                Ok(()) => valid.push(suggestion),
                Err(err) => warn!(id = %suggestion.id, error = %err, "skipping invalid suggestion"),
            }
        }

        let mut state = self.state();
        for suggestion in &valid {
            state
                .suggestions
                .entry(suggestion.id.clone())
                .or_insert_with(|| Tracked {
                    suggestion: suggestion.clone(),
                    status: SuggestionStatus::Pending,
                    combined_group_id: None,
                });
        }
        debug!(company_id = %self.company_id, count = valid.len(), "suggestions loaded");
        Ok(valid)
    }

    pub fn status(&self, suggestion_id: &str) -> Option<SuggestionStatus> {
        self.state()
            .suggestions
            .get(suggestion_id)
            .map(|t| t.status)
    }

    /// Group created by accepting `suggestion_id`
    pub fn combined_group(&self, suggestion_id: &str) -> Option<String> {
        self.state()
            .suggestions
            .get(suggestion_id)
            .and_then(|t| t.combined_group_id.clone())
    }

    /// Known suggestions still awaiting review, most similar first
    pub fn pending(&self) -> Vec<CombinationSuggestion> {
        let mut pending: Vec<_> = self
            .state()
            .suggestions
            .values()
            .filter(|t| t.status == SuggestionStatus::Pending)
            .map(|t| t.suggestion.clone())
            .collect();
        pending.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
        pending
    }

    /// Merge the two tasks of `suggestion` and retire the suggestion
    pub async fn accept(&self, suggestion: &CombinationSuggestion) -> Result<CombineTasksResponse> {
        validate_suggestion(suggestion)?;
        let request = CombineTasksRequest {
            task_ids: suggestion.task_ids(),
        };
        validate_combine_request(&request)?;
        let reservation = self.begin_review(suggestion, "accept")?;

        let api = self.api.clone();
        let response = self
            .coordinator
            .execute(&self.suggestion_key(&suggestion.id), || async move {
                api.combine_tasks(&request).await
            })
            .await?;
        self.finish_review(
            &suggestion.id,
            SuggestionStatus::Accepted,
            Some(response.combined_group_id.clone()),
        );
        drop(reservation);
        info!(
            suggestion_id = %suggestion.id,
            group_id = %response.combined_group_id,
            "suggestion accepted"
        );

        if !self.delete_accepted(&suggestion.id).await {
            self.state().undeleted.insert(suggestion.id.clone());
        }

        let record = self.audit.record(
            AuditAction::Combine,
            GROUP_ENTITY,
            &response.combined_group_id,
            json!({
                "taskIds": suggestion.task_ids(),
                "suggestionId": suggestion.id,
                "similarityScore": suggestion.similarity_score,
            }),
        );
        self.audit.append(record).await;
        self.track(suggestion, SuggestionStatus::Accepted);
        self.invalidate_lists();

        Ok(response)
    }

    /// Dismiss `suggestion` without merging
    pub async fn reject(&self, suggestion: &CombinationSuggestion) -> Result<()> {
        validate_suggestion(suggestion)?;
        let reservation = self.begin_review(suggestion, "reject")?;

        let api = self.api.clone();
        let id = suggestion.id.clone();
        self.coordinator
            .execute(&self.suggestion_key(&suggestion.id), || async move {
                api.delete_suggestion(&id).await
            })
            .await?;
        self.finish_review(&suggestion.id, SuggestionStatus::Rejected, None);
        drop(reservation);
        info!(suggestion_id = %suggestion.id, "suggestion rejected");

        let record = self.audit.record(
            AuditAction::Reject,
            SUGGESTION_ENTITY,
            &suggestion.id,
            json!({
                "taskIds": suggestion.task_ids(),
                "similarityScore": suggestion.similarity_score,
            }),
        );
        self.audit.append(record).await;
        self.track(suggestion, SuggestionStatus::Rejected);
        self.invalidate_lists();

        Ok(())
    }

    /// Split a combined group back into its tasks
    pub async fn rollback(&self, combined_group_id: &str) -> Result<TaskActionResponse> {
        let request = UndoCombineRequest {
            combined_group_id: combined_group_id.to_string(),
        };
        validate_undo_combine_request(&request)?;

        let api = self.api.clone();
        let response = self
            .coordinator
            .execute(&ResourceKey::tasks(&self.company_id), || async move {
                api.undo_combine(&request).await
            })
            .await?;
        info!(group_id = %combined_group_id, "combination rolled back");

        let task_ids = self
            .state()
            .suggestions
            .values()
            .find(|t| t.combined_group_id.as_deref() == Some(combined_group_id))
            .map(|t| t.suggestion.task_ids());
        let record = self.audit.record(
            AuditAction::Rollback,
            GROUP_ENTITY,
            combined_group_id,
            json!({ "taskIds": task_ids }),
        );
        self.audit.append(record).await;
        self.invalidate_lists();

        Ok(response)
    }

    /// Retry deleting accepted suggestions whose rows are still stored.
    /// Returns the ids that remain.
    pub async fn flush_undeleted(&self) -> HashSet<String> {
        let ids: Vec<String> = self.state().undeleted.iter().cloned().collect();
        for id in ids {
            if self.delete_accepted(&id).await {
                self.state().undeleted.remove(&id);
            }
        }
        self.state().undeleted.clone()
    }

    async fn delete_accepted(&self, suggestion_id: &str) -> bool {
        for attempt in 1..=DELETE_ATTEMPTS {
            match self.api.delete_suggestion(suggestion_id).await {
                Ok(()) => return true,
                Err(err) => warn!(
                    suggestion_id,
                    attempt,
                    error = %err,
                    "failed to delete accepted suggestion"
                ),
            }
        }
        false
    }

    fn suggestion_key(&self, suggestion_id: &str) -> ResourceKey {
        ResourceKey::new(["suggestions", self.company_id.as_str(), suggestion_id])
    }

    fn begin_review(&self, suggestion: &CombinationSuggestion, action: &str) -> Result<Reservation> {
        let mut state = self.state();
        let tracked = state
            .suggestions
            .entry(suggestion.id.clone())
            .or_insert_with(|| Tracked {
                suggestion: suggestion.clone(),
                status: SuggestionStatus::Pending,
                combined_group_id: None,
            });
        if tracked.status.is_terminal() {
            return Err(SyncError::InvalidTransition {
                id: suggestion.id.clone(),
                state: tracked.status.to_string(),
                action: action.to_string(),
            });
        }

        let task_ids = suggestion.task_ids();
        if let Some(busy) = task_ids.iter().find(|id| state.reserved.contains(*id)) {
            debug!(task_id = %busy, suggestion_id = %suggestion.id, "task reserved by another review");
            return Err(SyncError::conflict(&ResourceKey::task(&self.company_id, busy)));
        }
        state.reserved.extend(task_ids.iter().cloned());

        Ok(Reservation {
            state: self.state.clone(),
            task_ids,
        })
    }

    fn finish_review(&self, suggestion_id: &str, status: SuggestionStatus, group: Option<String>) {
        if let Some(tracked) = self.state().suggestions.get_mut(suggestion_id) {
            tracked.status = status;
            tracked.combined_group_id = group;
        }
    }

    fn track(&self, suggestion: &CombinationSuggestion, decision: SuggestionStatus) {
        self.telemetry.track(
            SUGGESTION_REVIEWED,
            json!({
                "suggestionId": suggestion.id,
                "decision": decision.as_str(),
                "similarityScore": suggestion.similarity_score,
            }),
        );
    }

    fn invalidate_lists(&self) {
        self.coordinator
            .invalidate(&ResourceKey::tasks(&self.company_id));
        self.coordinator
            .invalidate(&ResourceKey::suggestions(&self.company_id));
    }
}

/// Releases reserved task ids when dropped
struct Reservation {
    state: Arc<Mutex<ReviewState>>,
    task_ids: Vec<String>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.task_ids {
            state.reserved.remove(id);
        }
    }
}
