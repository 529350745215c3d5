//! Database models and persistence operations.

use chrono::{DateTime, Utc};
use cw_sync_contract::AuditRecord;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

/// Audit record waiting to be re-sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub record: AuditRecord,
    /// Failed delivery attempts so far, including the original append
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxEntry {
    fn from_row(row: &Row<'_>) -> crate::Result<Self> {
        let record: String = row.get(1)?;
        let enqueued_at: String = row.get(4)?;

        Ok(Self {
            id: row.get(0)?,
            record: serde_json::from_str(&record)?,
            attempts: row.get(2)?,
            last_error: row.get(3)?,
            enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
                .map_err(|e| crate::Error::generic(format!("Invalid enqueued_at: {}", e)))?
                .with_timezone(&Utc),
        })
    }
}

/// Database operations for the audit outbox.
pub struct AuditOutboxStore<'a> {
    conn: &'a Connection,
}

impl<'a> AuditOutboxStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Queue a record whose first append failed with `error`.
    pub fn enqueue(&self, record: &AuditRecord, error: &str) -> crate::Result<i64> {
        let payload = serde_json::to_string(record)?;
        self.conn.execute(
            r#"
            INSERT INTO audit_outbox (record, attempts, last_error, enqueued_at)
            VALUES (?, 1, ?, ?)
            "#,
            params![payload, error, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Entries with fewer than `max_attempts` failed attempts, oldest first.
    pub fn pending(&self, max_attempts: u32) -> crate::Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, record, attempts, last_error, enqueued_at
            FROM audit_outbox WHERE attempts < ? ORDER BY id ASC
            "#,
        )?;

        let mut rows = stmt.query(params![max_attempts])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(OutboxEntry::from_row(row)?);
        }
        Ok(entries)
    }

    /// Drop a delivered entry.
    pub fn remove(&self, id: i64) -> crate::Result<()> {
        self.conn
            .execute("DELETE FROM audit_outbox WHERE id = ?", params![id])?;
        Ok(())
    }

    /// Count another failed attempt for an entry.
    pub fn record_failure(&self, id: i64, error: &str) -> crate::Result<()> {
        self.conn.execute(
            "UPDATE audit_outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?",
            params![error, id],
        )?;
        Ok(())
    }

    /// Total number of queued entries, exhausted ones included.
    pub fn count(&self) -> crate::Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM audit_outbox", params![], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use cw_sync_contract::AuditAction;
    use serde_json::json;

    fn record(entity_id: &str) -> AuditRecord {
        AuditRecord {
            action: AuditAction::Combine,
            entity_type: "task_combination".to_string(),
            entity_id: entity_id.to_string(),
            diff: json!({ "taskIds": ["t1", "t2"] }),
            created_at: Utc::now(),
            actor_id: Some("u1".to_string()),
            company_id: Some("c1".to_string()),
        }
    }

    #[test]
    fn test_enqueue_and_pending() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            let store = AuditOutboxStore::new(conn);
            store.enqueue(&record("g1"), "timeout")?;
            store.enqueue(&record("g2"), "timeout")?;

            let pending = store.pending(5)?;
            assert_eq!(pending.len(), 2);
            assert_eq!(pending[0].record.entity_id, "g1");
            assert_eq!(pending[0].attempts, 1);
            assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_failures_exhaust_entry() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            let store = AuditOutboxStore::new(conn);
            let id = store.enqueue(&record("g1"), "timeout")?;

            store.record_failure(id, "still down")?;
            assert!(store.pending(2)?.is_empty());
            assert_eq!(store.pending(3)?[0].attempts, 2);
            assert_eq!(store.count()?, 1);

            store.remove(id)?;
            assert_eq!(store.count()?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_outbox_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let db = Database::open(&path).unwrap();
            db.with_connection(|conn| AuditOutboxStore::new(conn).enqueue(&record("g1"), "offline"))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let pending = db
            .with_connection(|conn| AuditOutboxStore::new(conn).pending(5))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record.action, AuditAction::Combine);
    }
}
