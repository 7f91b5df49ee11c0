//! Note model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util;

use super::EntityId;

/// A free-text note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Note {
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
    /// Free-form body text
    pub content: String,
}

impl Note {
    /// Create a new note with the given sort key
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        color: impl Into<String>,
        order: i64,
    ) -> Self {
        let now = util::now_ms();
        Self {
            id: EntityId::new(),
            title: title.into(),
            color: color.into(),
            created_at: now,
            updated_at: now,
            order,
            content: content.into(),
        }
    }

    /// Bump `updated_at` for a content edit
    ///
    /// Strictly increasing even when the wall clock has not advanced since
    /// the previous edit, so conflict resolution never sees a stale tie.
    pub fn touch(&mut self) {
        self.updated_at = util::now_ms().max(self.updated_at.saturating_add(1));
    }

    /// Validate field constraints before the note reaches any store
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("Note title must not be empty".to_string()));
        }
        if !util::is_valid_color(&self.color) {
            return Err(Error::Validation(format!("Invalid color: {}", self.color)));
        }
        if self.created_at <= 0 || self.updated_at <= 0 {
            return Err(Error::Validation(
                "Note timestamps must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
