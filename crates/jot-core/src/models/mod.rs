//! Data models

mod conflict;
mod entity;
mod note;
mod settings;
mod todo;

pub use conflict::{ConflictWinner, SyncConflict};
pub use entity::{Collection, Entity, EntityId};
pub use note::Note;
pub use settings::{Settings, ThemeMode};
pub use todo::{Todo, TodoItem};
