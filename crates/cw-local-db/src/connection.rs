//! Database connection management.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::migrations::MigrationManager;

/// Shared SQLite connection.
#[derive(Debug, Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
}

impl Database {
    /// Default database path.
    ///
    /// Priority order:
    /// 1. `CW_HOME` environment variable
    /// 2. `${XDG_STATE_HOME:-~/.local/state}/catering-workflow/sync.db`
    pub fn default_path() -> crate::Result<PathBuf> {
        if let Ok(cw_home) = std::env::var("CW_HOME") {
            return Ok(PathBuf::from(cw_home).join("sync.db"));
        }

        let state_home = match std::env::var("XDG_STATE_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME")
                    .map_err(|_| crate::Error::generic("HOME environment variable not set"))?;
                PathBuf::from(home).join(".local").join("state")
            }
        };
        Ok(state_home.join("catering-workflow").join("sync.db"))
    }

    /// Open the database at the default path, creating parent directories.
    pub fn open_default() -> crate::Result<Self> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::Error::generic(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }
        Self::open(&path)
    }

    /// Open a database at the specified path, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        debug!(path = %path.as_ref().display(), "opening local database");
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> crate::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> crate::Result<Self> {
        MigrationManager::migrate(&conn)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection locked.
    pub fn with_connection<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        let conn = self.connection.lock().map_err(|e| {
            crate::Error::generic(format!("Failed to acquire database lock: {}", e))
        })?;
        f(&conn)
    }

    /// Execute a transaction with automatic rollback on error.
    pub fn transaction<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        let conn = self.connection.lock().map_err(|e| {
            crate::Error::generic(format!("Failed to acquire database lock: {}", e))
        })?;

        let tx = conn.unchecked_transaction()?;
        match f(&tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}
