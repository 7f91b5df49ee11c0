//! Conflict resolution audit records

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Collection, EntityId};

/// Which side a conflict resolution kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

impl ConflictWinner {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ConflictWinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one resolved sync conflict
///
/// Conflicts are not errors; this log exists so a user can see when the
/// last-write-wins rule discarded one side of an edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Database row id
    pub id: i64,
    /// The conflicted record
    pub entity_id: EntityId,
    /// Collection the record belongs to
    pub collection: Collection,
    /// `updated_at` of the local copy at resolution time
    pub local_updated_at: i64,
    /// `updated_at` of the remote copy at resolution time
    pub remote_updated_at: i64,
    /// Side that was kept
    pub winner: ConflictWinner,
    /// When the resolution happened (Unix millis)
    pub resolved_at: i64,
}
