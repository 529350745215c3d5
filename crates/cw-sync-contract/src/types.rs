//! Contract types for the catering workflow sync layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Row-level event kinds a change filter can listen for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeEventKind {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    Any,
}

impl ChangeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEventKind::Insert => "INSERT",
            ChangeEventKind::Update => "UPDATE",
            ChangeEventKind::Delete => "DELETE",
            ChangeEventKind::Any => "*",
        }
    }

    /// Whether a filter listening for `self` receives an event of kind `other`
    pub fn covers(&self, other: ChangeEventKind) -> bool {
        *self == ChangeEventKind::Any || *self == other
    }
}

impl fmt::Display for ChangeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One table/event filter of a change-feed subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Validate)]
pub struct ChangeFilter {
    pub event: ChangeEventKind,
    #[validate(length(min = 1, message = "Schema cannot be empty"))]
    #[serde(default = "default_schema")]
    pub schema: String,
    #[validate(length(min = 1, message = "Table cannot be empty"))]
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeFilter {
    /// Listen for every event on `public.<table>`
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            event: ChangeEventKind::Any,
            schema: default_schema(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn with_event(mut self, event: ChangeEventKind) -> Self {
        self.event = event;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Row filter in `column=eq.value` form
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Scope the filter to one company's rows
    pub fn for_company(self, company_id: &str) -> Self {
        self.with_filter(format!("company_id=eq.{}", company_id))
    }

    /// Whether an inbound event falls under this filter.
    ///
    /// Row filters are evaluated by the transport; only the event kind,
    /// schema and table are compared here.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        self.event.covers(event.event)
            && self.schema == event.schema
            && self.table == event.table
    }
}

/// Change notification delivered by the feed. The payload is carried for
/// diagnostics only and is never merged into the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event: ChangeEventKind,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(
        rename = "commitTimestamp",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub commit_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub record: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn new(event: ChangeEventKind, table: impl Into<String>) -> Self {
        Self {
            event,
            schema: default_schema(),
            table: table.into(),
            filter: None,
            commit_timestamp: None,
            record: None,
        }
    }
}

/// Transport-level channel status as reported by the realtime transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::Closed => "CLOSED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelStatus::Subscribed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message framing of the realtime feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RealtimeMessage {
    Status { status: ChannelStatus },
    Change(ChangeEvent),
}

/// Hierarchical cache key, e.g. `["tasks", "c1", "t1"]`.
///
/// A key prefixes every key that extends it, so invalidating
/// `["tasks", "c1"]` also covers `["tasks", "c1", "t1"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(Vec<String>);

impl ResourceKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Collection key for one company's resource, e.g. `["tasks", "c1"]`
    pub fn collection(resource: &str, company_id: &str) -> Self {
        Self::new([resource, company_id])
    }

    /// Key of a single task row
    pub fn task(company_id: &str, task_id: &str) -> Self {
        Self::new(["tasks", company_id, task_id])
    }

    pub fn tasks(company_id: &str) -> Self {
        Self::collection("tasks", company_id)
    }

    pub fn suggestions(company_id: &str) -> Self {
        Self::collection("suggestions", company_id)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// The resource (first segment) this key refers to
    pub fn resource(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` is a prefix of (or equal to) `other`
    pub fn is_prefix_of(&self, other: &ResourceKey) -> bool {
        other.0.len() >= self.0.len() && other.0.iter().zip(&self.0).all(|(a, b)| a == b)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

/// `claim_task` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ClaimTaskRequest {
    #[validate(length(min = 1, message = "Task id cannot be empty"))]
    pub task_id: String,
    #[validate(length(max = 500, message = "Note is limited to 500 characters"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// `assign_task` request; `user_id = None` unassigns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AssignTaskRequest {
    #[validate(length(min = 1, message = "Task id cannot be empty"))]
    pub task_id: String,
    #[validate(length(min = 1, message = "User id cannot be empty"))]
    pub user_id: Option<String>,
}

/// `complete_task` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CompleteTaskRequest {
    #[validate(length(min = 1, message = "Task id cannot be empty"))]
    pub task_id: String,
}

/// `undo_task` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct UndoTaskRequest {
    #[validate(length(min = 1, message = "Undo token cannot be empty"))]
    pub undo_token: String,
}

/// `combine_tasks` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CombineTasksRequest {
    #[validate(length(min = 2, message = "At least two tasks are required"))]
    pub task_ids: Vec<String>,
}

/// `undo_combine` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct UndoCombineRequest {
    #[validate(length(min = 1, message = "Group id cannot be empty"))]
    pub combined_group_id: String,
}

/// Response of `claim_task`, `assign_task`, `complete_task`, `undo_task` and
/// `undo_combine`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub undo_token: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Response of `combine_tasks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineTasksResponse {
    pub success: bool,
    pub combined_group_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Proposed merge of two similar tasks, produced by the similarity job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CombinationSuggestion {
    #[validate(length(min = 1, message = "Suggestion id cannot be empty"))]
    pub id: String,
    #[validate(length(min = 1, message = "Base task id cannot be empty"))]
    pub base_task_id: String,
    #[validate(length(min = 1, message = "Suggested task id cannot be empty"))]
    pub suggested_task_id: String,
    #[validate(range(min = 0.0, max = 1.0, message = "Similarity must be within [0, 1]"))]
    pub similarity_score: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub company_id: Option<String>,
}

impl CombinationSuggestion {
    pub fn task_ids(&self) -> Vec<String> {
        vec![self.base_task_id.clone(), self.suggested_task_id.clone()]
    }

    pub fn references(&self, task_id: &str) -> bool {
        self.base_task_id == task_id || self.suggested_task_id == task_id
    }
}

/// Audited action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Claim,
    Assign,
    Complete,
    Undo,
    Combine,
    Reject,
    Rollback,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Claim => "claim",
            AuditAction::Assign => "assign",
            AuditAction::Complete => "complete",
            AuditAction::Undo => "undo",
            AuditAction::Combine => "combine",
            AuditAction::Reject => "reject",
            AuditAction::Rollback => "rollback",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit row persisted for every state-changing action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub diff: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub company_id: Option<String>,
}

/// Error body returned by the data store's REST surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hint: Option<String>,
}

/// Table names of the data store
pub mod tables {
    pub const TASKS: &str = "tasks";
    pub const SUGGESTIONS: &str = "task_combination_suggestions";
    pub const AUDIT_LOG: &str = "audit_log";
}

/// Error codes the backend uses to reject remote procedures
pub mod codes {
    pub const UNDO_EXPIRED: &str = "undo_expired";
    pub const UNDO_ALREADY_USED: &str = "undo_already_used";
    pub const TASK_CONFLICT: &str = "task_conflict";
    pub const NOT_FOUND: &str = "not_found";
}
