//! Database connection management

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;

use super::migrations;

/// Wrapper around the local `SQLite` database
///
/// The connection is guarded by a mutex so one handle can be shared between
/// the state manager and the sync coordinator. Writes that must be atomic
/// (order swaps, queue collapses) take a transaction on the locked guard.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the underlying connection
    ///
    /// A poisoned lock is recovered rather than propagated; `SQLite` keeps
    /// the file consistent even when a panicking thread held the guard.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Configure `SQLite` for local-first use
fn configure(conn: &Connection) -> Result<()> {
    // Enable WAL mode so readers are not blocked during sync writes.
    // journal_mode returns a result row, so execute() would error on it.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "cache_size", 10000).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("jot.db");
        Database::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_preserves_data() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("jot.db");

        {
            let db = Database::open(&path).unwrap();
            db.conn()
                .execute(
                    "INSERT INTO settings (key, value) VALUES ('probe', '1')",
                    [],
                )
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let value: String = db
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = 'probe'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "1");
    }
}
