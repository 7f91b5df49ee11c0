//! Last-write-wins conflict resolution

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::{ConflictWinner, Entity};

/// How imported records are reconciled with existing ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImportStrategy {
    /// Keep whichever copy was edited last; ties take the incoming copy
    #[default]
    Merge,
    /// Incoming records always win
    Replace,
    /// Existing records always win; only unknown ids are added
    Skip,
}

impl FromStr for ImportStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "replace" => Ok(Self::Replace),
            "skip" => Ok(Self::Skip),
            other => Err(Error::Validation(format!(
                "Unknown import strategy: {other}"
            ))),
        }
    }
}

/// Pick the winner between the local and remote copy of a record
///
/// Strictly greater `updated_at` wins; an exact tie keeps the remote copy,
/// so both sides converge on the same winner no matter which one resolves
/// first. Whole records win or lose; fields are never merged across copies.
#[must_use]
pub fn resolve(local: &Entity, remote: &Entity) -> ConflictWinner {
    if local.updated_at() > remote.updated_at() {
        ConflictWinner::Local
    } else {
        ConflictWinner::Remote
    }
}

/// The winning record by value
#[must_use]
pub fn merge(local: Entity, remote: Entity) -> Entity {
    match resolve(&local, &remote) {
        ConflictWinner::Local => local,
        ConflictWinner::Remote => remote,
    }
}
