use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::KeyValueStore;
use crate::error::StorageResult;

/// How long a writer waits for another connection's transaction.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed key-value store used by the sync daemon.
///
/// Several processes may open the same file. Transactions take SQLite's
/// write lock up front (`BEGIN IMMEDIATE`), so read-modify-write cycles
/// from different processes never interleave.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    writer: Mutex<()>,
}

impl SqliteStore {
    /// Open the database at the given path and initialize tables if needed
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            writer: Mutex::new(()),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn atomically(
        &self,
        f: &mut dyn FnMut(&dyn KeyValueStore) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let _writer = self.writer.lock()?;
        self.conn.lock()?.execute_batch("BEGIN IMMEDIATE")?;

        let result = f(self);

        let conn = self.conn.lock()?;
        match result {
            Ok(()) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!("failed to roll back storage transaction: {rollback}");
                }
                Err(e)
            }
        }
    }
}
