//! Local persistence for records and settings

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, types::Type, Connection};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{
    Collection, ConflictWinner, Entity, EntityId, Note, Settings, SyncConflict, Todo, TodoItem,
};
use crate::util;

use super::Database;

/// Settings row key
const SETTINGS_KEY: &str = "settings";

/// Trait for the device-local record store
///
/// The local copy is the source of truth for rendering. Every caller,
/// including the sync layer, goes through this interface, so tests can
/// substitute failing or observing implementations.
pub trait LocalStore: Send + Sync {
    /// Get a record by id
    fn get(&self, collection: Collection, id: EntityId) -> Result<Option<Entity>>;

    /// List a collection in render order: sort key ascending, then most
    /// recently updated first
    fn get_all(&self, collection: Collection) -> Result<Vec<Entity>>;

    /// Insert or replace the full record
    fn put(&self, entity: &Entity) -> Result<()>;

    /// Delete a record, returning whether it existed
    fn delete(&self, collection: Collection, id: EntityId) -> Result<bool>;

    /// Exchange the sort keys of two records in a single transaction
    fn swap_orders(&self, collection: Collection, a: EntityId, b: EntityId) -> Result<()>;

    /// Load settings, falling back to defaults when nothing is stored
    fn load_settings(&self) -> Result<Settings>;

    /// Persist settings
    fn save_settings(&self, settings: &Settings) -> Result<()>;

    /// Append an entry to the conflict resolution audit log
    fn record_conflict(
        &self,
        collection: Collection,
        id: EntityId,
        local_updated_at: i64,
        remote_updated_at: i64,
        winner: ConflictWinner,
    ) -> Result<()>;

    /// Most recently resolved conflicts, newest first
    fn recent_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// `SQLite` implementation of `LocalStore`
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    /// Create a new store over the given database
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

/// Decode a stored id column; a row whose key does not parse is corrupt
fn parse_id(raw: &str, column: usize) -> rusqlite::Result<EntityId> {
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Parse a note from a database row
fn parse_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    let id: String = row.get(0)?;
    Ok(Note {
        id: parse_id(&id, 0)?,
        title: row.get(1)?,
        color: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        order: row.get(5)?,
        content: row.get(6)?,
    })
}

/// Parse a todo from a database row
fn parse_todo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Todo> {
    let id: String = row.get(0)?;
    let items_json: String = row.get(6)?;
    let items: Vec<TodoItem> = serde_json::from_str(&items_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(Todo {
        id: parse_id(&id, 0)?,
        title: row.get(1)?,
        color: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        order: row.get(5)?,
        items,
        completed_count: row.get(7)?,
        total_count: row.get(8)?,
    })
}

/// Parse a conflict audit row
fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
    let entity_id: String = row.get(1)?;
    let table: String = row.get(2)?;
    let winner: String = row.get(5)?;
    Ok(SyncConflict {
        id: row.get(0)?,
        entity_id: parse_id(&entity_id, 1)?,
        collection: if table == "todos" {
            Collection::Todos
        } else {
            Collection::Notes
        },
        local_updated_at: row.get(3)?,
        remote_updated_at: row.get(4)?,
        winner: if winner == "local" {
            ConflictWinner::Local
        } else {
            ConflictWinner::Remote
        },
        resolved_at: row.get(6)?,
    })
}

fn read_order(conn: &Connection, collection: Collection, id: EntityId) -> Result<i64> {
    let result = conn.query_row(
        &format!(
            "SELECT sort_order FROM {} WHERE id = ?",
            collection.table()
        ),
        params![id.as_str()],
        |row| row.get(0),
    );

    match result {
        Ok(order) => Ok(order),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::NotFound(format!(
            "No {} record with id {id}",
            collection.table()
        ))),
        Err(e) => Err(e.into()),
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, collection: Collection, id: EntityId) -> Result<Option<Entity>> {
        let conn = self.db.conn();
        match collection {
            Collection::Notes => {
                let result = conn.query_row(
                    "SELECT id, title, color, created_at, updated_at, sort_order, content
                     FROM notes WHERE id = ?",
                    params![id.as_str()],
                    parse_note,
                );
                match result {
                    Ok(note) => Ok(Some(Entity::Note(note))),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Collection::Todos => {
                let result = conn.query_row(
                    "SELECT id, title, color, created_at, updated_at, sort_order,
                            items, completed_count, total_count
                     FROM todos WHERE id = ?",
                    params![id.as_str()],
                    parse_todo,
                );
                match result {
                    Ok(todo) => Ok(Some(Entity::Todo(todo))),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn get_all(&self, collection: Collection) -> Result<Vec<Entity>> {
        let conn = self.db.conn();
        match collection {
            Collection::Notes => {
                let mut stmt = conn.prepare(
                    "SELECT id, title, color, created_at, updated_at, sort_order, content
                     FROM notes
                     ORDER BY sort_order ASC, updated_at DESC",
                )?;
                let notes = stmt
                    .query_map([], parse_note)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(notes.into_iter().map(Entity::Note).collect())
            }
            Collection::Todos => {
                let mut stmt = conn.prepare(
                    "SELECT id, title, color, created_at, updated_at, sort_order,
                            items, completed_count, total_count
                     FROM todos
                     ORDER BY sort_order ASC, updated_at DESC",
                )?;
                let todos = stmt
                    .query_map([], parse_todo)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(todos.into_iter().map(Entity::Todo).collect())
            }
        }
    }

    fn put(&self, entity: &Entity) -> Result<()> {
        let conn = self.db.conn();
        match entity {
            Entity::Note(note) => {
                conn.execute(
                    "INSERT INTO notes (id, title, color, created_at, updated_at, sort_order, content)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                         title = excluded.title,
                         color = excluded.color,
                         created_at = excluded.created_at,
                         updated_at = excluded.updated_at,
                         sort_order = excluded.sort_order,
                         content = excluded.content",
                    params![
                        note.id.as_str(),
                        note.title,
                        note.color,
                        note.created_at,
                        note.updated_at,
                        note.order,
                        note.content
                    ],
                )?;
            }
            Entity::Todo(todo) => {
                let items = serde_json::to_string(&todo.items)?;
                conn.execute(
                    "INSERT INTO todos (id, title, color, created_at, updated_at, sort_order,
                                        items, completed_count, total_count)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                         title = excluded.title,
                         color = excluded.color,
                         created_at = excluded.created_at,
                         updated_at = excluded.updated_at,
                         sort_order = excluded.sort_order,
                         items = excluded.items,
                         completed_count = excluded.completed_count,
                         total_count = excluded.total_count",
                    params![
                        todo.id.as_str(),
                        todo.title,
                        todo.color,
                        todo.created_at,
                        todo.updated_at,
                        todo.order,
                        items,
                        todo.completed_count,
                        todo.total_count
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn delete(&self, collection: Collection, id: EntityId) -> Result<bool> {
        let changed = self.db.conn().execute(
            &format!("DELETE FROM {} WHERE id = ?", collection.table()),
            params![id.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn swap_orders(&self, collection: Collection, a: EntityId, b: EntityId) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let order_a = read_order(&tx, collection, a)?;
        let order_b = read_order(&tx, collection, b)?;

        let update = format!("UPDATE {} SET sort_order = ? WHERE id = ?", collection.table());
        tx.execute(&update, params![order_b, a.as_str()])?;
        tx.execute(&update, params![order_a, b.as_str()])?;

        tx.commit()?;
        Ok(())
    }

    fn load_settings(&self) -> Result<Settings> {
        let result = self.db.conn().query_row(
            "SELECT value FROM settings WHERE key = ?",
            params![SETTINGS_KEY],
            |row| row.get::<_, String>(0),
        );

        let json = match result {
            Ok(json) => json,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(Settings::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&json) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!("Stored settings are unreadable, using defaults: {e}");
                Ok(Settings::default())
            }
        }
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        self.db.conn().execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
            params![SETTINGS_KEY, json],
        )?;
        Ok(())
    }

    fn record_conflict(
        &self,
        collection: Collection,
        id: EntityId,
        local_updated_at: i64,
        remote_updated_at: i64,
        winner: ConflictWinner,
    ) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO sync_conflicts
                 (entity_id, entity_table, local_updated_at, remote_updated_at, winner, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                id.as_str(),
                collection.table(),
                local_updated_at,
                remote_updated_at,
                winner.as_str(),
                util::now_ms()
            ],
        )?;
        Ok(())
    }

    fn recent_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, entity_id, entity_table, local_updated_at, remote_updated_at,
                    winner, resolved_at
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;
        let conflicts = stmt
            .query_map(params![limit as i64], parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup() -> SqliteStore {
        SqliteStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_put_and_get_note() {
        let store = setup();
        let note = Note::new("Groceries", "milk, eggs", "#ffd500", 1000);
        store.put(&Entity::Note(note.clone())).unwrap();

        let loaded = store.get(Collection::Notes, note.id).unwrap().unwrap();
        assert_eq!(loaded, Entity::Note(note));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = setup();
        assert!(store
            .get(Collection::Notes, EntityId::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_put_replaces_whole_record() {
        let store = setup();
        let mut note = Note::new("Groceries", "milk", "#ffd500", 1000);
        store.put(&Entity::Note(note.clone())).unwrap();

        note.content = "milk, eggs".to_string();
        note.touch();
        store.put(&Entity::Note(note.clone())).unwrap();

        let all = store.get_all(Collection::Notes).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], Entity::Note(note));
    }

    #[test]
    fn test_get_all_sorts_by_order_then_recency() {
        let store = setup();
        let mut old = Note::new("Old", "", "#fff", 500);
        old.updated_at = 1_000;
        let mut new = Note::new("New", "", "#fff", 500);
        new.updated_at = 2_000;
        let top = Note::new("Top", "", "#fff", -500);

        store.put(&Entity::Note(old)).unwrap();
        store.put(&Entity::Note(new)).unwrap();
        store.put(&Entity::Note(top)).unwrap();

        let titles: Vec<_> = store
            .get_all(Collection::Notes)
            .unwrap()
            .iter()
            .map(|e| e.title().to_string())
            .collect();
        assert_eq!(titles, vec!["Top", "New", "Old"]);
    }

    #[test]
    fn test_delete_reports_presence() {
        let store = setup();
        let note = Note::new("Groceries", "", "#fff", 1000);
        store.put(&Entity::Note(note.clone())).unwrap();

        assert!(store.delete(Collection::Notes, note.id).unwrap());
        assert!(!store.delete(Collection::Notes, note.id).unwrap());
    }

    #[test]
    fn test_swap_orders() {
        let store = setup();
        let a = Note::new("A", "", "#fff", 1000);
        let b = Note::new("B", "", "#fff", 2000);
        store.put(&Entity::Note(a.clone())).unwrap();
        store.put(&Entity::Note(b.clone())).unwrap();

        store.swap_orders(Collection::Notes, a.id, b.id).unwrap();

        let a_after = store.get(Collection::Notes, a.id).unwrap().unwrap();
        let b_after = store.get(Collection::Notes, b.id).unwrap().unwrap();
        assert_eq!(a_after.order(), 2000);
        assert_eq!(b_after.order(), 1000);
        assert_eq!(a_after.updated_at(), a.updated_at);
        assert_eq!(b_after.updated_at(), b.updated_at);
    }

    #[test]
    fn test_swap_orders_unknown_id_is_error() {
        let store = setup();
        let a = Note::new("A", "", "#fff", 1000);
        store.put(&Entity::Note(a.clone())).unwrap();

        let result = store.swap_orders(Collection::Notes, a.id, EntityId::new());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_todo_round_trip() {
        let store = setup();
        let mut todo = Todo::new("Packing", "#fff", 1000);
        let item = todo.add_item("passport");
        todo.add_item("charger");
        todo.set_item_completed(item, true);

        store.put(&Entity::Todo(todo.clone())).unwrap();
        let loaded = store.get(Collection::Todos, todo.id).unwrap().unwrap();
        assert_eq!(loaded, Entity::Todo(todo));
    }

    #[test]
    fn test_collections_are_separate() {
        let store = setup();
        let note = Note::new("Groceries", "", "#fff", 1000);
        store.put(&Entity::Note(note.clone())).unwrap();

        assert!(store.get(Collection::Todos, note.id).unwrap().is_none());
        assert!(store.get_all(Collection::Todos).unwrap().is_empty());
    }

    #[test]
    fn test_settings_default_when_unset() {
        let store = setup();
        assert_eq!(store.load_settings().unwrap(), Settings::default());
    }

    #[test]
    fn test_settings_round_trip() {
        let store = setup();
        let mut settings = Settings::default();
        settings.font_size = 18;
        settings.default_color = "#a1b2c3".to_string();

        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings().unwrap(), settings);
    }

    #[test]
    fn test_conflict_log_newest_first() {
        let store = setup();
        let first = EntityId::new();
        let second = EntityId::new();

        store
            .record_conflict(Collection::Notes, first, 1, 2, ConflictWinner::Remote)
            .unwrap();
        store
            .record_conflict(Collection::Todos, second, 5, 3, ConflictWinner::Local)
            .unwrap();

        let conflicts = store.recent_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].entity_id, second);
        assert_eq!(conflicts[0].winner, ConflictWinner::Local);
        assert_eq!(conflicts[1].entity_id, first);

        assert_eq!(store.recent_conflicts(1).unwrap().len(), 1);
    }
}
