//! In-memory data store implementing [`RemoteApi`]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cw_client_api::{ClientApiError, ClientApiResult, RemoteApi};
use cw_sync_contract::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

use crate::feed::MockChangeFeed;

const DEFAULT_ACTOR: &str = "mock-user";

struct UndoEntry {
    key: ResourceKey,
    previous: Value,
    expires_at: DateTime<Utc>,
    used: bool,
}

#[derive(Default)]
struct MockState {
    rows: BTreeMap<ResourceKey, Value>,
    undo: HashMap<String, UndoEntry>,
    groups: HashMap<String, Vec<(ResourceKey, Value)>>,
    suggestions: Vec<CombinationSuggestion>,
    audit: Vec<AuditRecord>,
    calls: Vec<(String, Option<String>)>,
    failures: HashMap<String, VecDeque<ClientApiError>>,
    now: Option<DateTime<Utc>>,
    next_id: u64,
}

impl MockState {
    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn task_key(&self, task_id: &str) -> ClientApiResult<ResourceKey> {
        self.rows
            .keys()
            .find(|key| matches!(key.parts(), [res, _, id] if res == "tasks" && id == task_id))
            .cloned()
            .ok_or_else(|| {
                ClientApiError::rejected(codes::NOT_FOUND, format!("task {} not found", task_id))
            })
    }

    fn issue_undo(&mut self, key: ResourceKey, previous: Value, ttl: Duration) -> String {
        let token = self.next_id("undo");
        let expires_at = self.now() + ttl;
        self.undo.insert(
            token.clone(),
            UndoEntry {
                key,
                previous,
                expires_at,
                used: false,
            },
        );
        token
    }
}

/// Fake data store holding task rows, suggestions, undo tokens and the
/// audit log in memory.
///
/// Every RPC is recorded in a call log. Failures can be queued per RPC with
/// [`MockBackend::fail_next`] and calls can be held at a gate until released.
/// Clones share state.
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    gates: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    actor_id: String,
    undo_ttl: Duration,
    feed: Option<MockChangeFeed>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            gates: Arc::default(),
            actor_id: DEFAULT_ACTOR.to_string(),
            undo_ttl: Duration::hours(24),
            feed: None,
        }
    }

    /// Publish row changes to `feed` after every successful write
    pub fn with_feed(mut self, feed: MockChangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// User id recorded on claims
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    pub fn with_undo_ttl(mut self, ttl: Duration) -> Self {
        self.undo_ttl = ttl;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Seeding and inspection

    pub fn insert_task(&self, company_id: &str, task_id: &str, fields: Value) {
        let mut row = json!({
            "id": task_id,
            "company_id": company_id,
            "status": "pending",
            "claimed_by": null,
            "assigned_to": null,
            "combined_group_id": null,
        });
        if let (Some(row), Value::Object(fields)) = (row.as_object_mut(), fields) {
            row.extend(fields);
        }
        self.state().rows.insert(ResourceKey::task(company_id, task_id), row);
    }

    /// Store an arbitrary value under `key`
    pub fn insert_row(&self, key: ResourceKey, value: Value) {
        self.state().rows.insert(key, value);
    }

    pub fn task(&self, company_id: &str, task_id: &str) -> Option<Value> {
        self.state().rows.get(&ResourceKey::task(company_id, task_id)).cloned()
    }

    pub fn insert_suggestion(&self, suggestion: CombinationSuggestion) {
        self.state().suggestions.push(suggestion);
    }

    pub fn suggestions(&self) -> Vec<CombinationSuggestion> {
        self.state().suggestions.clone()
    }

    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.state().audit.clone()
    }

    /// Number of calls made to `rpc` (e.g. `"claim_task"`, `"fetch"`)
    pub fn call_count(&self, rpc: &str) -> usize {
        self.state().calls.iter().filter(|(name, _)| name == rpc).count()
    }

    /// Number of fetches of exactly `key`
    pub fn fetch_count(&self, key: &ResourceKey) -> usize {
        let key = key.to_string();
        self.state()
            .calls
            .iter()
            .filter(|(name, detail)| name == "fetch" && detail.as_deref() == Some(key.as_str()))
            .count()
    }

    // Clock

    pub fn now(&self) -> DateTime<Utc> {
        self.state().now()
    }

    /// Freeze the server clock at `now`
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state().now = Some(now);
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state();
        let now = state.now() + by;
        state.now = Some(now);
    }

    // Failure injection

    /// Fail the next call to `rpc` with `err`. Queued failures are consumed
    /// in order.
    pub fn fail_next(&self, rpc: &str, err: ClientApiError) {
        self.state()
            .failures
            .entry(rpc.to_string())
            .or_default()
            .push_back(err);
    }

    /// Hold every call to `rpc` until [`MockBackend::release`] lets it through
    pub fn hold(&self, rpc: &str) {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rpc.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held calls to `rpc` proceed
    pub fn release(&self, rpc: &str, count: usize) {
        if let Some(gate) = self.gate(rpc) {
            gate.add_permits(count);
        }
    }

    fn gate(&self, rpc: &str) -> Option<Arc<Semaphore>> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rpc)
            .cloned()
    }

    async fn enter(&self, rpc: &str, detail: Option<String>) -> ClientApiResult<()> {
        self.state().calls.push((rpc.to_string(), detail));

        if let Some(gate) = self.gate(rpc) {
            gate.acquire()
                .await
                .map_err(|_| ClientApiError::Transport("mock gate closed".into()))?
                .forget();
        }

        match self.state().failures.get_mut(rpc).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn publish(&self, kind: ChangeEventKind, table: &str, record: Value) {
        let Some(feed) = &self.feed else {
            return;
        };
        let mut event = ChangeEvent::new(kind, table);
        event.commit_timestamp = Some(self.now());
        event.record = Some(record);
        feed.publish(event).await;
    }

    fn action_response(&self, undo_token: Option<String>) -> TaskActionResponse {
        TaskActionResponse {
            success: true,
            undo_token,
            timestamp: self.now(),
        }
    }

    fn conflict(message: String) -> ClientApiError {
        ClientApiError::rejected(codes::TASK_CONFLICT, message)
    }

    /// Apply `patch` to a task row, returning the updated row and an undo
    /// token restoring the previous one
    fn patch_task(
        &self,
        task_id: &str,
        check: impl FnOnce(&Value) -> ClientApiResult<()>,
        patch: impl FnOnce(&mut Value),
        undoable: bool,
    ) -> ClientApiResult<(Value, Option<String>)> {
        let mut state = self.state();
        let key = state.task_key(task_id)?;
        let previous = state.rows.get(&key).cloned().unwrap_or_default();
        check(&previous)?;

        let mut updated = previous.clone();
        patch(&mut updated);
        state.rows.insert(key.clone(), updated.clone());

        let token = undoable.then(|| state.issue_undo(key, previous, self.undo_ttl));
        Ok((updated, token))
    }
}

fn field<'a>(row: &'a Value, name: &str) -> Option<&'a str> {
    row.get(name).and_then(Value::as_str)
}

#[async_trait]
impl RemoteApi for MockBackend {
    async fn fetch(&self, key: &ResourceKey) -> ClientApiResult<Value> {
        self.enter("fetch", Some(key.to_string())).await?;
        let state = self.state();

        if let Some(row) = state.rows.get(key) {
            return Ok(row.clone());
        }

        match key.parts() {
            [resource, company_id] if resource == "suggestions" => {
                let rows: Vec<_> = state
                    .suggestions
                    .iter()
                    .filter(|s| s.company_id.as_deref().map_or(true, |c| c == company_id))
                    .collect();
                Ok(serde_json::to_value(rows).unwrap_or_default())
            }
            [_, _] => {
                let depth = key.parts().len() + 1;
                let rows: Vec<Value> = state
                    .rows
                    .iter()
                    .filter(|(k, _)| k.parts().len() == depth && key.is_prefix_of(k))
                    .map(|(_, v)| v.clone())
                    .collect();
                Ok(Value::Array(rows))
            }
            _ => Ok(Value::Null),
        }
    }

    async fn claim_task(&self, request: &ClaimTaskRequest) -> ClientApiResult<TaskActionResponse> {
        self.enter("claim_task", Some(request.task_id.clone())).await?;
        let actor = self.actor_id.clone();

        let (row, token) = self.patch_task(
            &request.task_id,
            |row| match (field(row, "status"), field(row, "claimed_by")) {
                (Some("completed"), _) => {
                    Err(Self::conflict(format!("task {} is completed", request.task_id)))
                }
                (_, Some(owner)) if owner != actor => Err(Self::conflict(format!(
                    "task {} is claimed by {}",
                    request.task_id, owner
                ))),
                _ => Ok(()),
            },
            |row| {
                row["claimed_by"] = json!(self.actor_id);
                row["status"] = json!("in_progress");
                if let Some(note) = &request.note {
                    row["note"] = json!(note);
                }
            },
            true,
        )?;

        self.publish(ChangeEventKind::Update, tables::TASKS, row).await;
        Ok(self.action_response(token))
    }

    async fn assign_task(
        &self,
        request: &AssignTaskRequest,
    ) -> ClientApiResult<TaskActionResponse> {
        self.enter("assign_task", Some(request.task_id.clone())).await?;

        let (row, token) = self.patch_task(
            &request.task_id,
            |_| Ok(()),
            |row| row["assigned_to"] = json!(request.user_id),
            true,
        )?;

        self.publish(ChangeEventKind::Update, tables::TASKS, row).await;
        Ok(self.action_response(token))
    }

    async fn complete_task(
        &self,
        request: &CompleteTaskRequest,
    ) -> ClientApiResult<TaskActionResponse> {
        self.enter("complete_task", Some(request.task_id.clone())).await?;

        let (row, _) = self.patch_task(
            &request.task_id,
            |row| match field(row, "status") {
                Some("completed") => Err(Self::conflict(format!(
                    "task {} is already completed",
                    request.task_id
                ))),
                _ => Ok(()),
            },
            |row| row["status"] = json!("completed"),
            false,
        )?;

        self.publish(ChangeEventKind::Update, tables::TASKS, row).await;
        Ok(self.action_response(None))
    }

    async fn undo_task(&self, request: &UndoTaskRequest) -> ClientApiResult<TaskActionResponse> {
        self.enter("undo_task", Some(request.undo_token.clone())).await?;

        let row = {
            let mut state = self.state();
            let now = state.now();
            let entry = state.undo.get_mut(&request.undo_token).ok_or_else(|| {
                ClientApiError::rejected(codes::NOT_FOUND, "unknown undo token")
            })?;

            if entry.used {
                return Err(ClientApiError::rejected(
                    codes::UNDO_ALREADY_USED,
                    "undo token was already redeemed",
                ));
            }
            if now >= entry.expires_at {
                return Err(ClientApiError::rejected(
                    codes::UNDO_EXPIRED,
                    "undo token has expired",
                ));
            }

            entry.used = true;
            let (key, row) = (entry.key.clone(), entry.previous.clone());
            state.rows.insert(key, row.clone());
            row
        };

        self.publish(ChangeEventKind::Update, tables::TASKS, row).await;
        Ok(self.action_response(None))
    }

    async fn combine_tasks(
        &self,
        request: &CombineTasksRequest,
    ) -> ClientApiResult<CombineTasksResponse> {
        self.enter("combine_tasks", Some(request.task_ids.join(","))).await?;

        let (group_id, changed) = {
            let mut state = self.state();
            let mut previous = Vec::new();
            for task_id in &request.task_ids {
                let key = state.task_key(task_id)?;
                let row = state.rows.get(&key).cloned().unwrap_or_default();
                if let Some(group) = field(&row, "combined_group_id") {
                    return Err(Self::conflict(format!(
                        "task {} already belongs to group {}",
                        task_id, group
                    )));
                }
                previous.push((key, row));
            }

            let group_id = state.next_id("group");
            let mut changed = Vec::new();
            for (key, row) in &previous {
                let mut row = row.clone();
                row["combined_group_id"] = json!(group_id);
                state.rows.insert(key.clone(), row.clone());
                changed.push(row);
            }
            state.groups.insert(group_id.clone(), previous);
            (group_id, changed)
        };

        for row in changed {
            self.publish(ChangeEventKind::Update, tables::TASKS, row).await;
        }

        Ok(CombineTasksResponse {
            success: true,
            combined_group_id: group_id,
            timestamp: self.now(),
        })
    }

    async fn undo_combine(
        &self,
        request: &UndoCombineRequest,
    ) -> ClientApiResult<TaskActionResponse> {
        self.enter("undo_combine", Some(request.combined_group_id.clone()))
            .await?;

        let restored = {
            let mut state = self.state();
            let previous = state.groups.remove(&request.combined_group_id).ok_or_else(|| {
                ClientApiError::rejected(
                    codes::NOT_FOUND,
                    format!("group {} not found", request.combined_group_id),
                )
            })?;
            for (key, row) in &previous {
                state.rows.insert(key.clone(), row.clone());
            }
            previous
        };

        for (_, row) in restored {
            self.publish(ChangeEventKind::Update, tables::TASKS, row).await;
        }
        Ok(self.action_response(None))
    }

    async fn list_suggestions(
        &self,
        company_id: &str,
    ) -> ClientApiResult<Vec<CombinationSuggestion>> {
        self.enter("list_suggestions", Some(company_id.to_string()))
            .await?;

        let mut suggestions: Vec<_> = self
            .state()
            .suggestions
            .iter()
            .filter(|s| s.company_id.as_deref().map_or(true, |c| c == company_id))
            .cloned()
            .collect();
        suggestions.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
        Ok(suggestions)
    }

    async fn delete_suggestion(&self, suggestion_id: &str) -> ClientApiResult<()> {
        self.enter("delete_suggestion", Some(suggestion_id.to_string()))
            .await?;

        let removed = {
            let mut state = self.state();
            let position = state.suggestions.iter().position(|s| s.id == suggestion_id);
            position.map(|index| state.suggestions.remove(index))
        };

        // Deleting a missing row is not an error for the data store
        if let Some(suggestion) = removed {
            self.publish(
                ChangeEventKind::Delete,
                tables::SUGGESTIONS,
                json!({ "id": suggestion.id, "company_id": suggestion.company_id }),
            )
            .await;
        }
        Ok(())
    }

    async fn append_audit(&self, record: &AuditRecord) -> ClientApiResult<()> {
        self.enter("append_audit", Some(record.action.to_string()))
            .await?;
        self.state().audit.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MockBackend {
        let backend = MockBackend::new().with_actor("u1");
        backend.insert_task("c1", "t1", json!({ "title": "Prep canapes" }));
        backend.insert_task("c1", "t2", json!({ "title": "Plate canapes" }));
        backend
    }

    fn claim(task_id: &str) -> ClaimTaskRequest {
        ClaimTaskRequest {
            task_id: task_id.to_string(),
            note: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_collection_and_row() {
        let backend = backend();

        let rows = backend.fetch(&ResourceKey::tasks("c1")).await.unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);

        let row = backend.fetch(&ResourceKey::task("c1", "t1")).await.unwrap();
        assert_eq!(row["title"], "Prep canapes");

        let missing = backend.fetch(&ResourceKey::task("c1", "zz")).await.unwrap();
        assert!(missing.is_null());
        assert_eq!(backend.fetch_count(&ResourceKey::tasks("c1")), 1);
    }

    #[tokio::test]
    async fn test_claim_issues_undo_token() {
        let backend = backend();

        let response = backend.claim_task(&claim("t1")).await.unwrap();
        assert!(response.undo_token.is_some());
        assert_eq!(backend.task("c1", "t1").unwrap()["claimed_by"], "u1");

        let undo = UndoTaskRequest {
            undo_token: response.undo_token.unwrap(),
        };
        backend.undo_task(&undo).await.unwrap();
        assert!(backend.task("c1", "t1").unwrap()["claimed_by"].is_null());

        let again = backend.undo_task(&undo).await.unwrap_err();
        assert_eq!(again.code(), Some(codes::UNDO_ALREADY_USED));
    }

    #[tokio::test]
    async fn test_undo_rejected_after_expiry() {
        let backend = backend();
        let t0 = Utc::now();
        backend.set_now(t0);

        let token = backend.claim_task(&claim("t1")).await.unwrap().undo_token.unwrap();
        backend.advance(Duration::hours(25));

        let err = backend
            .undo_task(&UndoTaskRequest { undo_token: token })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::UNDO_EXPIRED));
        assert_eq!(backend.task("c1", "t1").unwrap()["claimed_by"], "u1");
    }

    #[tokio::test]
    async fn test_claim_conflict_with_other_owner() {
        let backend = backend();
        backend.insert_task("c1", "t3", json!({ "claimed_by": "someone-else" }));

        let err = backend.claim_task(&claim("t3")).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::TASK_CONFLICT));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let backend = backend();
        backend.fail_next("claim_task", ClientApiError::Server("boom".into()));

        assert!(backend.claim_task(&claim("t1")).await.is_err());
        assert!(backend.claim_task(&claim("t1")).await.is_ok());
        assert_eq!(backend.call_count("claim_task"), 2);
    }

    #[tokio::test]
    async fn test_combine_and_undo_combine() {
        let backend = backend();
        let response = backend
            .combine_tasks(&CombineTasksRequest {
                task_ids: vec!["t1".into(), "t2".into()],
            })
            .await
            .unwrap();

        let group = response.combined_group_id;
        assert_eq!(backend.task("c1", "t2").unwrap()["combined_group_id"], group);

        let again = backend
            .combine_tasks(&CombineTasksRequest {
                task_ids: vec!["t1".into(), "t2".into()],
            })
            .await
            .unwrap_err();
        assert_eq!(again.code(), Some(codes::TASK_CONFLICT));

        backend
            .undo_combine(&UndoCombineRequest {
                combined_group_id: group,
            })
            .await
            .unwrap();
        assert!(backend.task("c1", "t1").unwrap()["combined_group_id"].is_null());
    }

    #[tokio::test]
    async fn test_held_call_waits_for_release() {
        let backend = backend();
        backend.hold("complete_task");

        let pending = tokio::spawn({
            let backend = backend.clone();
            async move {
                backend
                    .complete_task(&CompleteTaskRequest {
                        task_id: "t1".into(),
                    })
                    .await
            }
        });

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        backend.release("complete_task", 1);
        pending.await.unwrap().unwrap();
        assert_eq!(backend.task("c1", "t1").unwrap()["status"], "completed");
    }
}
