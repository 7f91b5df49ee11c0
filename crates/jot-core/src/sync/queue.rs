//! Durable outbound sync queue
//!
//! Local writes that cannot reach the remote are parked here and replayed
//! later, in first-in order. The queue holds at most one entry per record:
//! a newer write collapses onto the queued one instead of appending, so
//! replay never sends superseded intermediate states.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{Collection, Entity, EntityId};
use crate::util;

/// Kind of remote write an entry replays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::Validation(format!("Unknown operation: {other}"))),
        }
    }
}

/// One queued remote write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub operation: Operation,
    #[serde(rename = "table")]
    pub collection: Collection,
    pub id: EntityId,
    /// Full record for inserts and updates; absent for deletes
    pub payload: Option<serde_json::Value>,
    pub enqueued_at: String,
    /// Replay order; assigned once and kept across collapses
    #[serde(skip)]
    pub position: i64,
}

/// SQLite-backed sync queue
pub struct SyncQueue {
    db: Arc<Database>,
}

impl SyncQueue {
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Queue an insert or update carrying the record's current state
    pub fn push_upsert(&self, operation: Operation, entity: &Entity) -> Result<()> {
        let payload = serde_json::to_string(&entity.to_value()?)?;
        self.apply_push(
            entity.collection(),
            entity.id(),
            operation,
            Some(payload),
        )
    }

    /// Queue a delete
    pub fn push_delete(&self, collection: Collection, id: EntityId) -> Result<()> {
        self.apply_push(collection, id, Operation::Delete, None)
    }

    fn apply_push(
        &self,
        collection: Collection,
        id: EntityId,
        operation: Operation,
        payload: Option<String>,
    ) -> Result<()> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let prior: Option<String> = match tx.query_row(
            "SELECT operation FROM sync_queue WHERE entity_id = ?",
            params![id.as_str()],
            |row| row.get(0),
        ) {
            Ok(op) => Some(op),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(prior) = prior {
            let prior: Operation = prior.parse().unwrap_or(Operation::Update);
            if operation == Operation::Delete {
                if prior == Operation::Insert {
                    // The remote never saw this record; drop the entry outright
                    tx.execute(
                        "DELETE FROM sync_queue WHERE entity_id = ?",
                        params![id.as_str()],
                    )?;
                } else {
                    tx.execute(
                        "UPDATE sync_queue SET operation = ?, payload = NULL, enqueued_at = ?
                         WHERE entity_id = ?",
                        params![Operation::Delete.as_str(), util::now_rfc3339(), id.as_str()],
                    )?;
                }
            } else {
                // A queued INSERT stays an INSERT: the remote still has not
                // seen the create, and a later delete can still cancel it
                let kept = match prior {
                    Operation::Insert => Operation::Insert,
                    Operation::Update => Operation::Update,
                    Operation::Delete => operation,
                };
                tx.execute(
                    "UPDATE sync_queue SET operation = ?, entity_table = ?, payload = ?, enqueued_at = ?
                     WHERE entity_id = ?",
                    params![
                        kept.as_str(),
                        collection.table(),
                        payload,
                        util::now_rfc3339(),
                        id.as_str()
                    ],
                )?;
            }
        } else {
            let position: i64 = tx.query_row(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM sync_queue",
                [],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO sync_queue
                     (entity_id, position, operation, entity_table, payload, enqueued_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    id.as_str(),
                    position,
                    operation.as_str(),
                    collection.table(),
                    payload,
                    util::now_rfc3339()
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Pending entries in first-in order
    ///
    /// Rows that can no longer be decoded are removed and logged rather
    /// than wedging replay forever.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        let rows = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(
                "SELECT entity_id, position, operation, entity_table, payload, enqueued_at
                 FROM sync_queue ORDER BY position ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RawEntry {
                        entity_id: row.get(0)?,
                        position: row.get(1)?,
                        operation: row.get(2)?,
                        entity_table: row.get(3)?,
                        payload: row.get(4)?,
                        enqueued_at: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut entries = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for raw in rows {
            match raw.decode() {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(
                        "Dropping unreadable sync queue entry for {}: {e}",
                        raw.entity_id
                    );
                    corrupt.push(raw.entity_id);
                }
            }
        }

        if !corrupt.is_empty() {
            let conn = self.db.conn();
            for id in corrupt {
                conn.execute("DELETE FROM sync_queue WHERE entity_id = ?", params![id])?;
            }
        }

        Ok(entries)
    }

    /// Remove the entry for a record, after successful replay
    pub fn remove(&self, id: EntityId) -> Result<()> {
        self.db.conn().execute(
            "DELETE FROM sync_queue WHERE entity_id = ?",
            params![id.as_str()],
        )?;
        Ok(())
    }

    /// Remove the entry for a record only if it still carries the state it
    /// was read with
    ///
    /// A mutation can collapse a newer payload onto the entry while replay
    /// has the older one in flight; that newer state must stay queued.
    pub fn remove_if_unchanged(&self, id: EntityId, enqueued_at: &str) -> Result<()> {
        self.db.conn().execute(
            "DELETE FROM sync_queue WHERE entity_id = ? AND enqueued_at = ?",
            params![id.as_str(), enqueued_at],
        )?;
        Ok(())
    }

    /// Number of pending entries
    pub fn len(&self) -> Result<usize> {
        let count: i64 =
            self.db
                .conn()
                .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Row as stored, before decoding
struct RawEntry {
    entity_id: String,
    position: i64,
    operation: String,
    entity_table: String,
    payload: Option<String>,
    enqueued_at: String,
}

impl RawEntry {
    fn decode(&self) -> Result<QueueEntry> {
        let id: EntityId = self
            .entity_id
            .parse()
            .map_err(|_| Error::Validation(format!("Invalid entity id: {}", self.entity_id)))?;
        let operation: Operation = self.operation.parse()?;
        let collection: Collection = self.entity_table.parse()?;
        let payload = match &self.payload {
            Some(json) => Some(serde_json::from_str(json)?),
            None => None,
        };
        if operation != Operation::Delete && payload.is_none() {
            return Err(Error::Validation(
                "Queue entry is missing its payload".to_string(),
            ));
        }
        Ok(QueueEntry {
            operation,
            collection,
            id,
            payload,
            enqueued_at: self.enqueued_at.clone(),
            position: self.position,
        })
    }
}
