//! Database schema definitions and constants.

// Current schema version
pub const SCHEMA_VERSION: u32 = 1;

// Table names
pub const TABLE_SCHEMA_MIGRATIONS: &str = "schema_migrations";
pub const TABLE_AUDIT_OUTBOX: &str = "audit_outbox";

// Column names for audit_outbox table
pub mod audit_outbox {
    pub const ID: &str = "id";
    pub const RECORD: &str = "record";
    pub const ATTEMPTS: &str = "attempts";
    pub const LAST_ERROR: &str = "last_error";
    pub const ENQUEUED_AT: &str = "enqueued_at";
}
