//! Entity identity and the tagged record type stored in collections

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{Note, Todo};

/// A unique identifier for a stored record, using UUID v7 (time-sortable)
///
/// Ids are client-generated and globally unique, so a record created offline
/// can never collide with a remote one when it first syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Create a new unique ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The two entity collections the engine stores and syncs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Notes,
    Todos,
}

impl Collection {
    /// Name of the table (and wire segment) backing this collection
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Notes => "notes",
            Self::Todos => "todos",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notes" => Ok(Self::Notes),
            "todos" => Ok(Self::Todos),
            other => Err(Error::Validation(format!("Unknown collection: {other}"))),
        }
    }
}

/// A record in one of the collections
///
/// Untrusted JSON (persisted rows, import files, remote responses) is
/// admitted only through [`Entity::from_value`], so everything past the
/// store boundary operates on typed records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Note(Note),
    Todo(Todo),
}

impl Entity {
    /// Parse and validate an untrusted JSON value as a record of `collection`
    ///
    /// Todo counts are derived fields and are recomputed here rather than
    /// trusted from the input.
    pub fn from_value(collection: Collection, value: serde_json::Value) -> Result<Self> {
        let entity = match collection {
            Collection::Notes => Self::Note(serde_json::from_value(value)?),
            Collection::Todos => {
                let mut todo: Todo = serde_json::from_value(value)?;
                todo.recount();
                Self::Todo(todo)
            }
        };
        entity.validate()?;
        Ok(entity)
    }

    /// Serialize to the camelCase JSON form used on disk and on the wire
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Note(note) => serde_json::to_value(note)?,
            Self::Todo(todo) => serde_json::to_value(todo)?,
        };
        Ok(value)
    }

    /// The collection this record belongs to
    #[must_use]
    pub const fn collection(&self) -> Collection {
        match self {
            Self::Note(_) => Collection::Notes,
            Self::Todo(_) => Collection::Todos,
        }
    }

    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::Note(note) => note.id,
            Self::Todo(todo) => todo.id,
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Note(note) => &note.title,
            Self::Todo(todo) => &todo.title,
        }
    }

    #[must_use]
    pub const fn updated_at(&self) -> i64 {
        match self {
            Self::Note(note) => note.updated_at,
            Self::Todo(todo) => todo.updated_at,
        }
    }

    #[must_use]
    pub const fn created_at(&self) -> i64 {
        match self {
            Self::Note(note) => note.created_at,
            Self::Todo(todo) => todo.created_at,
        }
    }

    #[must_use]
    pub const fn order(&self) -> i64 {
        match self {
            Self::Note(note) => note.order,
            Self::Todo(todo) => todo.order,
        }
    }

    /// Set the manual sort key without touching `updated_at`
    pub fn set_order(&mut self, order: i64) {
        match self {
            Self::Note(note) => note.order = order,
            Self::Todo(todo) => todo.order = order,
        }
    }

    /// Bump `updated_at` for a content edit
    pub fn touch(&mut self) {
        match self {
            Self::Note(note) => note.touch(),
            Self::Todo(todo) => todo.touch(),
        }
    }

    /// Validate field constraints before the record reaches any store
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Note(note) => note.validate(),
            Self::Todo(todo) => todo.validate(),
        }
    }

    #[must_use]
    pub const fn as_note(&self) -> Option<&Note> {
        match self {
            Self::Note(note) => Some(note),
            Self::Todo(_) => None,
        }
    }

    #[must_use]
    pub const fn as_todo(&self) -> Option<&Todo> {
        match self {
            Self::Todo(todo) => Some(todo),
            Self::Note(_) => None,
        }
    }

    #[must_use]
    pub fn into_note(self) -> Option<Note> {
        match self {
            Self::Note(note) => Some(note),
            Self::Todo(_) => None,
        }
    }

    #[must_use]
    pub fn into_todo(self) -> Option<Todo> {
        match self {
            Self::Todo(todo) => Some(todo),
            Self::Note(_) => None,
        }
    }
}

impl From<Note> for Entity {
    fn from(note: Note) -> Self {
        Self::Note(note)
    }
}

impl From<Todo> for Entity {
    fn from(todo: Todo) -> Self {
        Self::Todo(todo)
    }
}
