//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|v| v != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: Initial schema
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Notes table. The sort key column is named sort_order because
        // ORDER is a reserved word in SQL.
        "CREATE TABLE IF NOT EXISTS notes (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            color TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            content TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_notes_sort ON notes(sort_order ASC, updated_at DESC)",
        // Todos table; items are stored as a JSON array
        "CREATE TABLE IF NOT EXISTS todos (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            color TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            items TEXT NOT NULL,
            completed_count INTEGER NOT NULL,
            total_count INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_todos_sort ON todos(sort_order ASC, updated_at DESC)",
        // Settings table (local only)
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        // Outbound sync queue, at most one entry per entity
        "CREATE TABLE IF NOT EXISTS sync_queue (
            entity_id TEXT PRIMARY KEY,
            position INTEGER NOT NULL,
            operation TEXT NOT NULL,
            entity_table TEXT NOT NULL,
            payload TEXT,
            enqueued_at TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_position ON sync_queue(position ASC)",
        // Record migration version
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict resolution audit log
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            entity_table TEXT NOT NULL,
            local_updated_at INTEGER NOT NULL,
            remote_updated_at INTEGER NOT NULL,
            winner TEXT NOT NULL,
            resolved_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(entity_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved ON sync_conflicts(resolved_at DESC)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
