//! In-memory view of the data set with command methods
//!
//! [`StateManager`] is the surface a frontend talks to. It keeps a rendered
//! snapshot of every note, todo and the settings in a watch channel, exposes
//! command methods that turn user intent into [`Mutation`]s, and reloads the
//! snapshot from the local store after every command so the view can never
//! drift from what was actually persisted. Remote failures never roll the
//! view back; only a local write failure does, by way of that reload.

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::models::{Collection, Entity, EntityId, Note, Settings, SyncConflict, Todo};
use crate::order;
use crate::sync::coordinator::{Direction, Mutation, SyncCoordinator};
use crate::sync::resolver::ImportStrategy;
use crate::sync::ReplayReport;
use crate::transfer::{self, ImportSummary};
use crate::util;

/// Rendered view of the whole data set
///
/// Lists are sorted for display: ascending by sort key, newest edit first
/// on ties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub notes: Vec<Note>,
    pub todos: Vec<Todo>,
    pub settings: Settings,
}

/// Reactive facade over the coordinator and the local store
#[derive(Clone)]
pub struct StateManager {
    coordinator: Arc<SyncCoordinator>,
    view: watch::Sender<Snapshot>,
}

impl StateManager {
    /// Build a manager with the view loaded from the store
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Result<Self> {
        let snapshot = load_snapshot(&coordinator)?;
        let (view, _) = watch::channel(snapshot);
        Ok(Self { coordinator, view })
    }

    /// Current snapshot of the view
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.view.borrow().clone()
    }

    /// Watch the view; a new value arrives after every command
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.view.subscribe()
    }

    /// Re-read the view from the local store and notify watchers
    pub fn reload(&self) -> Result<()> {
        let snapshot = load_snapshot(&self.coordinator)?;
        self.view.send_replace(snapshot);
        Ok(())
    }

    /// Create a note at the top of the list
    pub async fn create_note(
        &self,
        title: impl Into<String>,
        content: impl Into<String>,
        color: impl Into<String>,
    ) -> Result<Note> {
        let order = {
            let view = self.view.borrow();
            let orders: Vec<i64> = view.notes.iter().map(|n| n.order).collect();
            order::order_for_insert_at_top(&orders, util::now_ms())
        };
        let note = Note::new(title, content, color, order);
        let entity = self.run(Mutation::Create(Entity::Note(note))).await?;
        expect_note(entity)
    }

    /// Edit a note's fields; `None` leaves a field as it is
    pub async fn update_note(
        &self,
        id: EntityId,
        title: Option<String>,
        content: Option<String>,
        color: Option<String>,
    ) -> Result<Note> {
        let mut note = self.find_note(id)?;
        if let Some(title) = title {
            note.title = title;
        }
        if let Some(content) = content {
            note.content = content;
        }
        if let Some(color) = color {
            note.color = color;
        }
        note.touch();
        let entity = self.run(Mutation::Update(Entity::Note(note))).await?;
        expect_note(entity)
    }

    /// Create an empty checklist at the top of the list
    pub async fn create_todo(
        &self,
        title: impl Into<String>,
        color: impl Into<String>,
    ) -> Result<Todo> {
        let order = {
            let view = self.view.borrow();
            let orders: Vec<i64> = view.todos.iter().map(|t| t.order).collect();
            order::order_for_insert_at_top(&orders, util::now_ms())
        };
        let todo = Todo::new(title, color, order);
        let entity = self.run(Mutation::Create(Entity::Todo(todo))).await?;
        expect_todo(entity)
    }

    /// Edit a checklist's fields; `None` leaves a field as it is
    pub async fn update_todo(
        &self,
        id: EntityId,
        title: Option<String>,
        color: Option<String>,
    ) -> Result<Todo> {
        let mut todo = self.find_todo(id)?;
        if let Some(title) = title {
            todo.title = title;
        }
        if let Some(color) = color {
            todo.color = color;
        }
        todo.touch();
        let entity = self.run(Mutation::Update(Entity::Todo(todo))).await?;
        expect_todo(entity)
    }

    /// Append an item to a checklist; returns the updated todo and item id
    pub async fn add_todo_item(
        &self,
        todo_id: EntityId,
        text: impl Into<String>,
    ) -> Result<(Todo, EntityId)> {
        let mut todo = self.find_todo(todo_id)?;
        let item_id = todo.add_item(text);
        let entity = self.run(Mutation::Update(Entity::Todo(todo))).await?;
        Ok((expect_todo(entity)?, item_id))
    }

    /// Flip an item between checked and unchecked
    pub async fn toggle_item(&self, todo_id: EntityId, item_id: EntityId) -> Result<Todo> {
        let mut todo = self.find_todo(todo_id)?;
        let Some(item) = todo.items.iter().find(|item| item.id == item_id) else {
            return Err(Error::NotFound(format!("No item with id {item_id}")));
        };
        let checked = !item.completed;
        todo.set_item_completed(item_id, checked);
        let entity = self.run(Mutation::Update(Entity::Todo(todo))).await?;
        expect_todo(entity)
    }

    /// Replace an item's text
    pub async fn set_item_text(
        &self,
        todo_id: EntityId,
        item_id: EntityId,
        text: impl Into<String>,
    ) -> Result<Todo> {
        let mut todo = self.find_todo(todo_id)?;
        if !todo.set_item_text(item_id, text) {
            return Err(Error::NotFound(format!("No item with id {item_id}")));
        }
        let entity = self.run(Mutation::Update(Entity::Todo(todo))).await?;
        expect_todo(entity)
    }

    /// Remove an item from a checklist
    pub async fn remove_item(&self, todo_id: EntityId, item_id: EntityId) -> Result<Todo> {
        let mut todo = self.find_todo(todo_id)?;
        if !todo.remove_item(item_id) {
            return Err(Error::NotFound(format!("No item with id {item_id}")));
        }
        let entity = self.run(Mutation::Update(Entity::Todo(todo))).await?;
        expect_todo(entity)
    }

    /// Move a record one place toward the top
    pub async fn move_up(&self, collection: Collection, id: EntityId) -> Result<Entity> {
        self.run(Mutation::SwapWithNeighbor {
            collection,
            id,
            direction: Direction::Up,
        })
        .await
    }

    /// Move a record one place toward the bottom
    pub async fn move_down(&self, collection: Collection, id: EntityId) -> Result<Entity> {
        self.run(Mutation::SwapWithNeighbor {
            collection,
            id,
            direction: Direction::Down,
        })
        .await
    }

    /// Move a record to a position in the rendered list (0 is the top)
    pub async fn move_to(
        &self,
        collection: Collection,
        id: EntityId,
        to_index: usize,
    ) -> Result<Entity> {
        self.run(Mutation::Move {
            collection,
            id,
            to_index,
        })
        .await
    }

    /// Move a record above everything else in its collection
    pub async fn move_to_top(&self, collection: Collection, id: EntityId) -> Result<Entity> {
        self.run(Mutation::MoveToTop(collection, id)).await
    }

    /// Delete a record; returns the deleted copy
    pub async fn delete(&self, collection: Collection, id: EntityId) -> Result<Entity> {
        self.run(Mutation::Delete(collection, id)).await
    }

    /// Replace the settings
    pub fn update_settings(&self, settings: Settings) -> Result<Settings> {
        self.coordinator.store().save_settings(&settings)?;
        self.reload()?;
        Ok(settings)
    }

    /// Replay queued writes now, then refresh the view
    pub async fn sync_now(&self) -> Result<ReplayReport> {
        let report = self.coordinator.sync_now().await;
        self.reload()?;
        report
    }

    /// Render the whole data set as an export document
    pub fn export_document(&self) -> Result<String> {
        let file = transfer::export(self.coordinator.store().as_ref())?;
        transfer::render_json(&file).map_err(Error::from)
    }

    /// Apply an export document, then refresh the view
    pub async fn import_document(
        &self,
        text: &str,
        strategy: ImportStrategy,
    ) -> Result<ImportSummary> {
        let file = transfer::parse_import(text)?;
        let summary = transfer::import(&self.coordinator, file, strategy).await;
        self.reload()?;
        summary
    }

    /// Number of queued writes waiting for replay
    pub fn pending_sync_count(&self) -> Result<usize> {
        self.coordinator.pending_count()
    }

    /// Most recently resolved sync conflicts, newest first
    pub fn recent_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.coordinator.store().recent_conflicts(limit)
    }

    /// Run a mutation and bring the view back in line with the store
    ///
    /// The reload happens on both outcomes: a failed mutation may have
    /// stopped partway, and a successful one may have rewritten records
    /// beyond the returned one (swaps, renormalization, conflict losers).
    async fn run(&self, mutation: Mutation) -> Result<Entity> {
        let result = self.coordinator.apply(mutation).await;
        match &result {
            Ok(_) => self.reload()?,
            Err(_) => {
                if let Err(reload_error) = self.reload() {
                    tracing::error!("Could not reload view after failed command: {reload_error}");
                }
            }
        }
        result
    }

    fn find_note(&self, id: EntityId) -> Result<Note> {
        self.view
            .borrow()
            .notes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No notes record with id {id}")))
    }

    fn find_todo(&self, id: EntityId) -> Result<Todo> {
        self.view
            .borrow()
            .todos
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No todos record with id {id}")))
    }
}

fn load_snapshot(coordinator: &SyncCoordinator) -> Result<Snapshot> {
    let store = coordinator.store();
    Ok(Snapshot {
        notes: store
            .get_all(Collection::Notes)?
            .into_iter()
            .filter_map(Entity::into_note)
            .collect(),
        todos: store
            .get_all(Collection::Todos)?
            .into_iter()
            .filter_map(Entity::into_todo)
            .collect(),
        settings: store.load_settings()?,
    })
}

fn expect_note(entity: Entity) -> Result<Note> {
    entity
        .into_note()
        .ok_or_else(|| Error::Validation("Expected a notes record".to_string()))
}

fn expect_todo(entity: Entity) -> Result<Todo> {
    entity
        .into_todo()
        .ok_or_else(|| Error::Validation("Expected a todos record".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, LocalStore, SqliteStore};
    use crate::models::ThemeMode;
    use crate::sync::connectivity::ConnectivityMonitor;
    use crate::sync::queue::SyncQueue;
    use crate::sync::remote::{HttpRemoteStore, RemoteStore};
    use pretty_assertions::assert_eq;

    fn setup() -> StateManager {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(SqliteStore::new(Arc::clone(&db)));
        // Offline in these tests, so the endpoint is never contacted
        let remote = Arc::new(HttpRemoteStore::new("http://localhost:9", "owner", "token").unwrap());
        let coordinator = Arc::new(SyncCoordinator::new(
            store as Arc<dyn LocalStore>,
            remote as Arc<dyn RemoteStore>,
            SyncQueue::new(Arc::clone(&db)),
            Arc::new(ConnectivityMonitor::new()),
        ));
        StateManager::new(coordinator).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_note_renders_newest_first() {
        let state = setup();
        state.create_note("First", "", "#fff").await.unwrap();
        state.create_note("Second", "", "#fff").await.unwrap();

        let snapshot = state.snapshot();
        let titles: Vec<_> = snapshot.notes.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["Second", "First"]);
        assert!(snapshot.notes[0].order < snapshot.notes[1].order);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_note_bumps_timestamp() {
        let state = setup();
        let note = state.create_note("Groceries", "milk", "#fff").await.unwrap();

        let updated = state
            .update_note(note.id, Some("Errands".to_string()), None, None)
            .await
            .unwrap();

        assert_eq!(updated.title, "Errands");
        assert_eq!(updated.content, "milk");
        assert!(updated.updated_at > note.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_missing_note_is_not_found() {
        let state = setup();
        let result = state
            .update_note(EntityId::new(), Some("x".to_string()), None, None)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_toggle_item_flips_and_recounts() {
        let state = setup();
        let todo = state.create_todo("Packing", "#fff").await.unwrap();
        let (todo, item_id) = state.add_todo_item(todo.id, "passport").await.unwrap();
        assert_eq!(todo.total_count, 1);

        let checked = state.toggle_item(todo.id, item_id).await.unwrap();
        assert_eq!(checked.completed_count, 1);
        assert!(checked.items[0].completed);

        let unchecked = state.toggle_item(todo.id, item_id).await.unwrap();
        assert_eq!(unchecked.completed_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_item_unknown_id_is_not_found() {
        let state = setup();
        let todo = state.create_todo("Packing", "#fff").await.unwrap();
        let result = state.remove_item(todo.id, EntityId::new()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_down_swaps_render_positions() {
        let state = setup();
        state.create_note("Older", "", "#fff").await.unwrap();
        let newest = state.create_note("Newest", "", "#fff").await.unwrap();

        state
            .move_down(Collection::Notes, newest.id)
            .await
            .unwrap();

        let titles: Vec<_> = state
            .snapshot()
            .notes
            .iter()
            .map(|n| n.title.clone())
            .collect();
        assert_eq!(titles, vec!["Older", "Newest"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reorder_never_touches_timestamps() {
        let state = setup();
        let a = state.create_note("A", "", "#fff").await.unwrap();
        let b = state.create_note("B", "", "#fff").await.unwrap();

        state.move_up(Collection::Notes, a.id).await.unwrap();
        state.move_to(Collection::Notes, a.id, 1).await.unwrap();
        state.move_to_top(Collection::Notes, a.id).await.unwrap();

        let snapshot = state.snapshot();
        let stored_a = snapshot.notes.iter().find(|n| n.id == a.id).unwrap();
        let stored_b = snapshot.notes.iter().find(|n| n.id == b.id).unwrap();
        assert_eq!(stored_a.updated_at, a.updated_at);
        assert_eq!(stored_b.updated_at, b.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_removes_from_view() {
        let state = setup();
        let note = state.create_note("Gone soon", "", "#fff").await.unwrap();
        let deleted = state.delete(Collection::Notes, note.id).await.unwrap();

        assert_eq!(deleted.id(), note.id);
        assert!(state.snapshot().notes.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_settings_persists() {
        let state = setup();
        let mut settings = state.snapshot().settings;
        settings.theme = ThemeMode::Dark;
        settings.font_size = 18;

        state.update_settings(settings.clone()).unwrap();

        assert_eq!(state.snapshot().settings, settings);
        state.reload().unwrap();
        assert_eq!(state.snapshot().settings.theme, ThemeMode::Dark);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commands_notify_watchers() {
        let state = setup();
        let mut rx = state.subscribe();
        assert!(!rx.has_changed().unwrap());

        state.create_note("Ping", "", "#fff").await.unwrap();
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.notes.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_validation_error_leaves_view_intact() {
        let state = setup();
        state.create_note("Kept", "", "#fff").await.unwrap();

        let result = state.create_note("   ", "", "#fff").await;
        assert!(matches!(result, Err(Error::Validation(_))));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.notes.len(), 1);
        assert_eq!(snapshot.notes[0].title, "Kept");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_import_and_export_round_trip() {
        let state = setup();
        state.create_note("Groceries", "milk", "#fff").await.unwrap();
        let document = state.export_document().unwrap();

        let other = setup();
        let summary = other
            .import_document(&document, ImportStrategy::Merge)
            .await
            .unwrap();

        assert_eq!(summary.created, 1);
        assert_eq!(other.snapshot().notes[0].title, "Groceries");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_commands_accumulate_pending_writes() {
        let state = setup();
        let note = state.create_note("Groceries", "", "#fff").await.unwrap();
        state
            .update_note(note.id, None, Some("milk".to_string()), None)
            .await
            .unwrap();

        // Create and update collapsed into one queued entry
        assert_eq!(state.pending_sync_count().unwrap(), 1);
    }
}
