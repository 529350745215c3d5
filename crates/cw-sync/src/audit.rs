//! Best-effort audit appends with a retry outbox.

use chrono::Utc;
use cw_client_api::RemoteApi;
use cw_local_db::{AuditOutboxStore, Database, OutboxEntry};
use cw_sync_contract::{AuditAction, AuditRecord};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;
use crate::Result;

/// Holds audit records whose append failed until they can be re-sent
pub trait AuditOutbox: Send + Sync {
    fn push(&self, record: &AuditRecord, error: &str) -> Result<i64>;
    /// Entries with fewer than `max_attempts` failed attempts, oldest first
    fn pending(&self, max_attempts: u32) -> Result<Vec<OutboxEntry>>;
    fn remove(&self, id: i64) -> Result<()>;
    fn record_failure(&self, id: i64, error: &str) -> Result<()>;
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Outbox that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    entries: Mutex<Vec<OutboxEntry>>,
    next_id: AtomicI64,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<OutboxEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditOutbox for MemoryOutbox {
    fn push(&self, record: &AuditRecord, error: &str) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries().push(OutboxEntry {
            id,
            record: record.clone(),
            attempts: 1,
            last_error: Some(error.to_string()),
            enqueued_at: Utc::now(),
        });
        Ok(id)
    }

    fn pending(&self, max_attempts: u32) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .entries()
            .iter()
            .filter(|e| e.attempts < max_attempts)
            .cloned()
            .collect())
    }

    fn remove(&self, id: i64) -> Result<()> {
        self.entries().retain(|e| e.id != id);
        Ok(())
    }

    fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        if let Some(entry) = self.entries().iter_mut().find(|e| e.id == id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries().len())
    }
}

/// Outbox persisted in the local SQLite database, so queued records survive
/// a restart
#[derive(Clone)]
pub struct LocalDbOutbox {
    db: Database,
}

impl LocalDbOutbox {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::open_default()?))
    }
}

impl AuditOutbox for LocalDbOutbox {
    fn push(&self, record: &AuditRecord, error: &str) -> Result<i64> {
        Ok(self
            .db
            .with_connection(|conn| AuditOutboxStore::new(conn).enqueue(record, error))?)
    }

    fn pending(&self, max_attempts: u32) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .db
            .with_connection(|conn| AuditOutboxStore::new(conn).pending(max_attempts))?)
    }

    fn remove(&self, id: i64) -> Result<()> {
        Ok(self
            .db
            .with_connection(|conn| AuditOutboxStore::new(conn).remove(id))?)
    }

    fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        Ok(self
            .db
            .with_connection(|conn| AuditOutboxStore::new(conn).record_failure(id, error))?)
    }

    fn len(&self) -> Result<usize> {
        Ok(self
            .db
            .with_connection(|conn| AuditOutboxStore::new(conn).count())?)
    }
}

/// What happened to an appended record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Append failed; the record waits in the outbox
    Queued,
    /// Append failed and the outbox could not take it either
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub failed: usize,
    /// Entries that are still queued, exhausted ones included
    pub remaining: usize,
}

/// Appends audit records for state-changing actions.
///
/// An append never fails its caller: the action it describes has already
/// happened on the server.
#[derive(Clone)]
pub struct AuditTrail {
    api: Arc<dyn RemoteApi>,
    outbox: Arc<dyn AuditOutbox>,
    scheduler: Arc<dyn Scheduler>,
    actor_id: Option<String>,
    company_id: Option<String>,
    max_attempts: u32,
}

impl AuditTrail {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        outbox: Arc<dyn AuditOutbox>,
        scheduler: Arc<dyn Scheduler>,
        max_attempts: u32,
    ) -> Self {
        Self {
            api,
            outbox,
            scheduler,
            actor_id: None,
            company_id: None,
            max_attempts,
        }
    }

    pub fn with_actor(mut self, actor_id: Option<String>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn with_company(mut self, company_id: Option<String>) -> Self {
        self.company_id = company_id;
        self
    }

    pub fn outbox(&self) -> &Arc<dyn AuditOutbox> {
        &self.outbox
    }

    /// Build a record stamped with this trail's actor, company and clock
    pub fn record(
        &self,
        action: AuditAction,
        entity_type: &str,
        entity_id: &str,
        diff: Value,
    ) -> AuditRecord {
        AuditRecord {
            action,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            diff,
            created_at: self.scheduler.now(),
            actor_id: self.actor_id.clone(),
            company_id: self.company_id.clone(),
        }
    }

    pub async fn append(&self, record: AuditRecord) -> Delivery {
        let error = match self.api.append_audit(&record).await {
            Ok(()) => {
                debug!(action = %record.action, entity_id = %record.entity_id, "audit appended");
                return Delivery::Delivered;
            }
            Err(err) => err.to_string(),
        };

        warn!(
            action = %record.action,
            entity_id = %record.entity_id,
            %error,
            "audit append failed, queued for retry"
        );
        match self.outbox.push(&record, &error) {
            Ok(_) => Delivery::Queued,
            Err(err) => {
                warn!(action = %record.action, error = %err, "audit record dropped");
                Delivery::Dropped
            }
        }
    }

    /// Re-send queued records, oldest first
    pub async fn flush_outbox(&self) -> Result<FlushReport> {
        let mut report = FlushReport::default();

        for entry in self.outbox.pending(self.max_attempts)? {
            match self.api.append_audit(&entry.record).await {
                Ok(()) => {
                    self.outbox.remove(entry.id)?;
                    report.delivered += 1;
                }
                Err(err) => {
                    self.outbox.record_failure(entry.id, &err.to_string())?;
                    report.failed += 1;
                    if entry.attempts + 1 >= self.max_attempts {
                        warn!(id = entry.id, action = %entry.record.action, "audit record gave up");
                    }
                }
            }
        }

        report.remaining = self.outbox.len()?;
        if report.delivered > 0 || report.failed > 0 {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                remaining = report.remaining,
                "audit outbox flushed"
            );
        }
        Ok(report)
    }
}
