//! Optimistic task actions.

use cw_client_api::RemoteApi;
use cw_sync_contract::validation::{
    validate_assign_request, validate_claim_request, validate_complete_request,
    validate_undo_request,
};
use cw_sync_contract::{
    AssignTaskRequest, AuditAction, ClaimTaskRequest, CompleteTaskRequest, ResourceKey,
    TaskActionResponse, UndoTaskRequest,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

use crate::audit::AuditTrail;
use crate::mutation::OptimisticMutationCoordinator;
use crate::undo::{UndoToken, UndoTokenLedger};
use crate::{Result, SyncError};

const TASK_ENTITY: &str = "task";

/// Result of a task action: the server response plus the undo token it
/// handed out, if any
#[derive(Debug, Clone, PartialEq)]
pub struct TaskActionOutcome {
    pub response: TaskActionResponse,
    pub undo: Option<UndoToken>,
}

/// Claim, assign and complete tasks of one company.
///
/// Each action patches the cached task row before the RPC, issues the undo
/// token the server returns and appends an audit record.
#[derive(Clone)]
pub struct TaskActions {
    company_id: String,
    actor_id: Option<String>,
    coordinator: OptimisticMutationCoordinator,
    api: Arc<dyn RemoteApi>,
    ledger: UndoTokenLedger,
    audit: AuditTrail,
}

impl TaskActions {
    pub fn new(
        company_id: impl Into<String>,
        actor_id: Option<String>,
        coordinator: OptimisticMutationCoordinator,
        api: Arc<dyn RemoteApi>,
        ledger: UndoTokenLedger,
        audit: AuditTrail,
    ) -> Self {
        Self {
            company_id: company_id.into(),
            actor_id,
            coordinator,
            api,
            ledger,
            audit,
        }
    }

    pub fn ledger(&self) -> &UndoTokenLedger {
        &self.ledger
    }

    pub async fn claim(&self, task_id: &str, note: Option<String>) -> Result<TaskActionOutcome> {
        let actor = self
            .actor_id
            .clone()
            .ok_or_else(|| SyncError::config("claiming a task requires an actor id"))?;
        let request = ClaimTaskRequest {
            task_id: task_id.to_string(),
            note,
        };
        validate_claim_request(&request)?;

        let mut fields = json!({ "claimed_by": actor, "status": "in_progress" });
        if let Some(note) = &request.note {
            fields["note"] = json!(note);
        }
        let api = self.api.clone();
        self.run(AuditAction::Claim, task_id, fields, || async move {
            api.claim_task(&request).await
        })
        .await
    }

    /// Assign to `user_id`, or unassign with `None`
    pub async fn assign(&self, task_id: &str, user_id: Option<String>) -> Result<TaskActionOutcome> {
        let request = AssignTaskRequest {
            task_id: task_id.to_string(),
            user_id,
        };
        validate_assign_request(&request)?;

        let fields = json!({ "assigned_to": request.user_id });
        let api = self.api.clone();
        self.run(AuditAction::Assign, task_id, fields, || async move {
            api.assign_task(&request).await
        })
        .await
    }

    pub async fn complete(&self, task_id: &str) -> Result<TaskActionOutcome> {
        let request = CompleteTaskRequest {
            task_id: task_id.to_string(),
        };
        validate_complete_request(&request)?;

        let api = self.api.clone();
        self.run(
            AuditAction::Complete,
            task_id,
            json!({ "status": "completed" }),
            || async move { api.complete_task(&request).await },
        )
        .await
    }

    /// Reverse an earlier claim or assignment
    pub async fn undo(&self, token: &UndoToken) -> Result<TaskActionResponse> {
        validate_undo_request(&UndoTaskRequest {
            undo_token: token.token.clone(),
        })?;

        let response = self.ledger.redeem(token).await?;
        let record = self.audit.record(
            AuditAction::Undo,
            TASK_ENTITY,
            &token.resource_id,
            json!({ "undoToken": token.token }),
        );
        self.audit.append(record).await;
        self.coordinator
            .invalidate(&ResourceKey::tasks(&self.company_id));
        Ok(response)
    }

    async fn run<F, Fut>(
        &self,
        action: AuditAction,
        task_id: &str,
        fields: Value,
        remote_call: F,
    ) -> Result<TaskActionOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = cw_client_api::ClientApiResult<TaskActionResponse>>,
    {
        let key = ResourceKey::task(&self.company_id, task_id);
        let diff = fields.clone();
        let company_id = self.company_id.clone();

        let response = self
            .coordinator
            .mutate_with(
                &key,
                |current| Ok(patch_row(current, task_id, &company_id, fields)),
                remote_call,
            )
            .await?;
        info!(%key, action = %action, "task action confirmed");

        let undo = response
            .undo_token
            .as_ref()
            .map(|token| self.ledger.issue(&key, token.clone()));

        let record = self.audit.record(action, TASK_ENTITY, task_id, diff);
        self.audit.append(record).await;
        self.coordinator
            .invalidate(&ResourceKey::tasks(&self.company_id));

        Ok(TaskActionOutcome { response, undo })
    }
}

/// Merge `fields` into the cached row, starting from a bare row when the
/// task is not cached
fn patch_row(current: Option<&Value>, task_id: &str, company_id: &str, fields: Value) -> Value {
    let mut row = match current {
        Some(Value::Object(row)) => row.clone(),
        _ => {
            let mut row = Map::new();
            row.insert("id".into(), json!(task_id));
            row.insert("company_id".into(), json!(company_id));
            row
        }
    };
    if let Value::Object(fields) = fields {
        row.extend(fields);
    }
    Value::Object(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryOutbox;
    use crate::cache::QueryCache;
    use crate::config::ConflictPolicy;
    use crate::scheduler::ManualScheduler;
    use cw_client_api::ClientApiError;
    use cw_rest_client_mock::MockBackend;
    use cw_sync_contract::codes;

    struct Fixture {
        backend: MockBackend,
        cache: QueryCache,
        actions: TaskActions,
    }

    async fn fixture(actor: Option<&str>) -> Fixture {
        let backend = MockBackend::new().with_actor("u1");
        backend.insert_task("c1", "t1", json!({ "title": "Fold napkins" }));
        let api: Arc<dyn RemoteApi> = Arc::new(backend.clone());
        let scheduler = Arc::new(ManualScheduler::new());

        let cache = QueryCache::new();
        cache
            .refetch(api.as_ref(), &ResourceKey::task("c1", "t1"))
            .await
            .unwrap();
        let coordinator =
            OptimisticMutationCoordinator::new(cache.clone(), api.clone(), ConflictPolicy::Reject);
        let ledger = UndoTokenLedger::new(
            coordinator.clone(),
            api.clone(),
            scheduler.clone(),
            chrono::Duration::hours(24),
        );
        let audit = AuditTrail::new(api.clone(), Arc::new(MemoryOutbox::new()), scheduler, 5)
            .with_actor(actor.map(String::from));
        let actions = TaskActions::new(
            "c1",
            actor.map(String::from),
            coordinator,
            api,
            ledger,
            audit,
        );
        Fixture {
            backend,
            cache,
            actions,
        }
    }

    #[test]
    fn test_patch_row_merges_fields() {
        let row = json!({ "id": "t1", "status": "pending", "title": "x" });
        let patched = patch_row(Some(&row), "t1", "c1", json!({ "status": "completed" }));
        assert_eq!(patched, json!({ "id": "t1", "status": "completed", "title": "x" }));

        let fresh = patch_row(None, "t9", "c1", json!({ "status": "completed" }));
        assert_eq!(fresh, json!({ "id": "t9", "company_id": "c1", "status": "completed" }));
    }

    #[tokio::test]
    async fn test_claim_settles_to_server_row() {
        let f = fixture(Some("u1")).await;

        let outcome = f.actions.claim("t1", Some("on it".into())).await.unwrap();

        let row = f.cache.data(&ResourceKey::task("c1", "t1")).unwrap();
        assert_eq!(row, f.backend.task("c1", "t1").unwrap());
        assert_eq!(row["claimed_by"], "u1");
        assert_eq!(outcome.undo.unwrap().resource_id, "t1");
        assert_eq!(f.backend.audit_log()[0].action, AuditAction::Claim);
    }

    #[tokio::test]
    async fn test_claim_without_actor_is_refused() {
        let f = fixture(None).await;
        let err = f.actions.claim("t1", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert_eq!(f.backend.call_count("claim_task"), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_never_touches_cache_or_network() {
        let f = fixture(Some("u1")).await;
        let before = f.cache.get(&ResourceKey::task("c1", "t1"));

        let err = f.actions.claim("", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        let err = f.actions.assign("t1", Some(String::new())).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        assert_eq!(f.cache.get(&ResourceKey::task("c1", "t1")), before);
        assert_eq!(f.backend.call_count("claim_task"), 0);
        assert_eq!(f.backend.call_count("assign_task"), 0);
    }

    #[tokio::test]
    async fn test_rejected_complete_rolls_back() {
        let f = fixture(Some("u1")).await;
        let key = ResourceKey::task("c1", "t1");
        let before = f.cache.get(&key);
        f.backend.fail_next(
            "complete_task",
            ClientApiError::rejected(codes::TASK_CONFLICT, "task is locked"),
        );

        let err = f.actions.complete("t1").await.unwrap_err();

        assert_eq!(err.user_message(), "task is locked");
        assert_eq!(f.cache.get(&key), before);
        assert!(f.backend.audit_log().is_empty());
    }

    #[tokio::test]
    async fn test_undo_reverses_assignment() {
        let f = fixture(Some("u1")).await;
        let outcome = f.actions.assign("t1", Some("u2".into())).await.unwrap();
        let token = outcome.undo.unwrap();

        f.actions.undo(&token).await.unwrap();

        let row = f.cache.data(&ResourceKey::task("c1", "t1")).unwrap();
        assert!(row["assigned_to"].is_null());
        let actions: Vec<_> = f.backend.audit_log().iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![AuditAction::Assign, AuditAction::Undo]);
    }

    #[tokio::test]
    async fn test_complete_issues_no_undo() {
        let f = fixture(Some("u1")).await;
        let outcome = f.actions.complete("t1").await.unwrap();
        assert!(outcome.undo.is_none());
        assert_eq!(f.backend.task("c1", "t1").unwrap()["status"], "completed");
    }
}
