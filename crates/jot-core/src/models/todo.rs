//! Todo (checklist) model

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::util;

use super::EntityId;

/// A single line in a checklist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TodoItem {
    /// Unique within the parent todo
    pub id: EntityId,
    /// Item text
    pub text: String,
    /// Whether the item is checked off
    pub completed: bool,
    /// Creation timestamp (Unix millis)
    pub created_at: i64,
}

impl TodoItem {
    /// Create a new unchecked item
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            text: text.into(),
            completed: false,
            created_at: util::now_ms(),
        }
    }
}

/// A checklist with derived completion counts
///
/// `completed_count` and `total_count` are derived from `items` and are
/// recomputed on every item mutation; they are never edited directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Todo {
    /// Unique identifier, client-generated
    pub id: EntityId,
    /// Short display title
    pub title: String,
    /// Card color as `#RGB` or `#RRGGBB` hex
    pub color: String,
    /// Creation timestamp (Unix millis)
    pub created_at: i64,
    /// Timestamp of the last content edit (Unix millis)
    pub updated_at: i64,
    /// Manual sort key; smaller values render first
    pub order: i64,
    /// Checklist lines, in display order
    pub items: Vec<TodoItem>,
    /// Number of checked items
    pub completed_count: u32,
    /// Number of items
    pub total_count: u32,
}

impl Todo {
    /// Create a new empty checklist with the given sort key
    #[must_use]
    pub fn new(title: impl Into<String>, color: impl Into<String>, order: i64) -> Self {
        let now = util::now_ms();
        Self {
            id: EntityId::new(),
            title: title.into(),
            color: color.into(),
            created_at: now,
            updated_at: now,
            order,
            items: Vec::new(),
            completed_count: 0,
            total_count: 0,
        }
    }

    /// Bump `updated_at` for a content edit
    ///
    /// Strictly increasing even when the wall clock has not advanced since
    /// the previous edit, so conflict resolution never sees a stale tie.
    pub fn touch(&mut self) {
        self.updated_at = util::now_ms().max(self.updated_at.saturating_add(1));
    }

    /// Recompute the derived completion counts from `items`
    pub fn recount(&mut self) {
        self.total_count = u32::try_from(self.items.len()).unwrap_or(u32::MAX);
        self.completed_count =
            u32::try_from(self.items.iter().filter(|item| item.completed).count())
                .unwrap_or(u32::MAX);
    }

    /// Append a new unchecked item and return its id
    ///
    /// Counts are recomputed and `updated_at` is bumped.
    pub fn add_item(&mut self, text: impl Into<String>) -> EntityId {
        let item = TodoItem::new(text);
        let id = item.id;
        self.items.push(item);
        self.recount();
        self.touch();
        id
    }

    /// Check or uncheck an item; returns false when the id is unknown
    pub fn set_item_completed(&mut self, item_id: EntityId, completed: bool) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == item_id) else {
            return false;
        };
        if item.completed != completed {
            item.completed = completed;
            self.recount();
            self.touch();
        }
        true
    }

    /// Replace an item's text; returns false when the id is unknown
    pub fn set_item_text(&mut self, item_id: EntityId, text: impl Into<String>) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == item_id) else {
            return false;
        };
        item.text = text.into();
        self.touch();
        true
    }

    /// Remove an item; returns false when the id is unknown
    pub fn remove_item(&mut self, item_id: EntityId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != item_id);
        if self.items.len() == before {
            return false;
        }
        self.recount();
        self.touch();
        true
    }

    /// Validate field constraints before the todo reaches any store
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("Todo title must not be empty".to_string()));
        }
        if !util::is_valid_color(&self.color) {
            return Err(Error::Validation(format!("Invalid color: {}", self.color)));
        }
        if self.created_at <= 0 || self.updated_at <= 0 {
            return Err(Error::Validation(
                "Todo timestamps must be positive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            if item.text.trim().is_empty() {
                return Err(Error::Validation(
                    "Todo items must not be empty".to_string(),
                ));
            }
            if !seen.insert(item.id) {
                return Err(Error::Validation(format!(
                    "Duplicate todo item id: {}",
                    item.id
                )));
            }
        }
        Ok(())
    }
}
