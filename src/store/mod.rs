//! SQLite persistence shared by the vault, mapper and ledger
//!
//! One connection guarded by a mutex; every store borrows it through
//! [`Database::with_conn`]. Statements are short and never held across an
//! `.await`.

use crate::{BridgeError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

/// Handle to the bugbridge database
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "Opening bugbridge database");

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| BridgeError::Storage("database lock poisoned".to_string()))?;
        f(&mut conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Initialize database schema
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS integrations (
            tenant_id TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            state TEXT NOT NULL,
            credentials TEXT NOT NULL,
            provider_config TEXT NOT NULL,
            sync_direction TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, provider_type)
        );

        CREATE TABLE IF NOT EXISTS oauth_pending (
            state TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            provider_config TEXT NOT NULL,
            sync_direction TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS external_links (
            tenant_id TEXT NOT NULL,
            bug_id TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            external_id TEXT NOT NULL,
            external_url TEXT,
            last_synced_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, bug_id, provider_type),
            UNIQUE (tenant_id, provider_type, external_id)
        );

        CREATE TABLE IF NOT EXISTS field_mapping_versions (
            tenant_id TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, provider_type)
        );

        CREATE TABLE IF NOT EXISTS field_mapping_entries (
            tenant_id TEXT NOT NULL,
            provider_type TEXT NOT NULL,
            kind TEXT NOT NULL,
            direction TEXT NOT NULL,
            lookup_key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (tenant_id, provider_type, kind, direction, lookup_key)
        );

        CREATE INDEX IF NOT EXISTS idx_oauth_pending_tenant ON oauth_pending(tenant_id, provider_type);
        CREATE INDEX IF NOT EXISTS idx_external_links_external
            ON external_links(tenant_id, provider_type, external_id);
        "#,
    )?;

    Ok(())
}
