//! Client-side synchronization for the catering workflow platform
//!
//! Keeps a local query cache consistent with the remote data store:
//! realtime channels invalidate cached resources, a polling fallback takes
//! over while a channel is down, and state-changing actions are applied
//! optimistically and rolled back when the server refuses them. Undo tokens
//! and the combination review workflow build on the same coordinator.
//!
//! [`SyncClient`] owns all of it for one session.

pub mod audit;
pub mod cache;
pub mod client;
pub mod combination;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod mutation;
pub mod polling;
pub mod realtime;
pub mod refetch;
pub mod scheduler;
pub mod subscription;
pub mod tasks;
pub mod telemetry;
pub mod undo;

pub use audit::{AuditOutbox, AuditTrail, Delivery, FlushReport, LocalDbOutbox, MemoryOutbox};
pub use cache::{CacheEvent, QueryCache, QueryState};
pub use client::{SyncClient, SyncClientBuilder};
pub use combination::{CombinationReviewWorkflow, SuggestionStatus};
pub use config::{AuditConfig, ConflictPolicy, PollingConfig, SyncConfig};
pub use dispatcher::{CacheInvalidationDispatcher, InvalidationCallback};
pub use error::SyncError;
pub use health::{ConnectionHealthTracker, ConnectionState};
pub use mutation::{MutationStatus, OptimisticMutationCoordinator, PendingMutation};
pub use polling::{PollingFallbackScheduler, RefreshSink};
pub use realtime::{RealtimeChannel, RealtimeHub};
pub use refetch::Refetcher;
pub use scheduler::{CancelHandle, ManualScheduler, ScheduledTask, Scheduler, TokioScheduler};
pub use subscription::ChannelSubscription;
pub use tasks::{TaskActionOutcome, TaskActions};
pub use telemetry::{MemoryTelemetry, NoopTelemetry, TelemetrySink, TracingTelemetry};
pub use undo::{UndoToken, UndoTokenLedger};

pub type Result<T> = std::result::Result<T, SyncError>;
pub type SyncResult<T> = Result<T>;
