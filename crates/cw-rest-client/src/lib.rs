//! REST and realtime client for the catering workflow data store
//!
//! This crate provides the HTTP implementation of the query and
//! remote-procedure interfaces (`RemoteApi`) and the SSE implementation of the
//! change-feed interface (`ChangeFeed`).

pub mod auth;
pub mod client;
pub mod error;
pub mod sse;

pub use auth::*;
pub use client::*;
pub use error::*;
pub use sse::SseChangeFeed;

use async_trait::async_trait;
use cw_client_api::{ClientApiResult, RemoteApi};
use cw_sync_contract::*;

#[async_trait]
impl RemoteApi for client::RestClient {
    async fn fetch(&self, key: &ResourceKey) -> ClientApiResult<serde_json::Value> {
        Ok(self.fetch(key).await?)
    }

    async fn claim_task(&self, request: &ClaimTaskRequest) -> ClientApiResult<TaskActionResponse> {
        Ok(self.claim_task(request).await?)
    }

    async fn assign_task(
        &self,
        request: &AssignTaskRequest,
    ) -> ClientApiResult<TaskActionResponse> {
        Ok(self.assign_task(request).await?)
    }

    async fn complete_task(
        &self,
        request: &CompleteTaskRequest,
    ) -> ClientApiResult<TaskActionResponse> {
        Ok(self.complete_task(request).await?)
    }

    async fn undo_task(&self, request: &UndoTaskRequest) -> ClientApiResult<TaskActionResponse> {
        Ok(self.undo_task(request).await?)
    }

    async fn combine_tasks(
        &self,
        request: &CombineTasksRequest,
    ) -> ClientApiResult<CombineTasksResponse> {
        Ok(self.combine_tasks(request).await?)
    }

    async fn undo_combine(
        &self,
        request: &UndoCombineRequest,
    ) -> ClientApiResult<TaskActionResponse> {
        Ok(self.undo_combine(request).await?)
    }

    async fn list_suggestions(
        &self,
        company_id: &str,
    ) -> ClientApiResult<Vec<CombinationSuggestion>> {
        Ok(self.list_suggestions(company_id).await?)
    }

    async fn delete_suggestion(&self, suggestion_id: &str) -> ClientApiResult<()> {
        Ok(self.delete_suggestion(suggestion_id).await?)
    }

    async fn append_audit(&self, record: &AuditRecord) -> ClientApiResult<()> {
        Ok(self.append_audit(record).await?)
    }
}
