//! Export and import of the whole data set as a single JSON document
//!
//! The file carries every note, todo and the settings under a version tag.
//! Import is all-or-nothing: a document that fails schema validation is
//! rejected before anything is applied. Accepted records flow through the
//! coordinator like ordinary edits, keeping their file timestamps, so they
//! propagate to other devices through the usual sync path.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ConflictWinner, Entity, Note, Settings, Todo};
use crate::sync::coordinator::{Mutation, SyncCoordinator};
use crate::sync::resolver::{self, ImportStrategy};
use crate::util;

/// The only export schema version this build reads and writes
pub const EXPORT_VERSION: &str = "1";

/// On-disk export document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExportFile {
    pub version: String,
    /// RFC 3339 timestamp of when the export was produced
    pub exported_at: String,
    pub notes: Vec<Note>,
    pub todos: Vec<Todo>,
    pub settings: Settings,
}

/// What an import did, per record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Records with ids new to this device
    pub created: usize,
    /// Existing records replaced by the file's copy
    pub updated: usize,
    /// Existing records kept over the file's copy
    pub skipped: usize,
    /// Whether the file's settings replaced the local ones
    pub settings_replaced: bool,
}

/// Snapshot the whole store into an export document
pub fn export(store: &dyn crate::db::LocalStore) -> Result<ExportFile> {
    let notes = store
        .get_all(crate::models::Collection::Notes)?
        .into_iter()
        .filter_map(Entity::into_note)
        .collect();
    let todos = store
        .get_all(crate::models::Collection::Todos)?
        .into_iter()
        .filter_map(Entity::into_todo)
        .collect();

    Ok(ExportFile {
        version: EXPORT_VERSION.to_string(),
        exported_at: util::now_rfc3339(),
        notes,
        todos,
        settings: store.load_settings()?,
    })
}

/// Render an export document as pretty-printed JSON
pub fn render_json(file: &ExportFile) -> serde_json::Result<String> {
    serde_json::to_string_pretty(file)
}

/// Build a deterministic default file name for export flows
#[must_use]
pub fn suggested_export_file_name(timestamp_ms: i64) -> String {
    format!("jot-export-{timestamp_ms}.json")
}

/// Parse and validate an export document
///
/// Any defect rejects the whole document: malformed JSON, unknown fields,
/// an unsupported version or a record that fails validation. Todo counts
/// are derived fields and are recomputed rather than trusted.
pub fn parse_import(text: &str) -> Result<ExportFile> {
    let mut file: ExportFile = serde_json::from_str(text)
        .map_err(|e| Error::InvalidImport(format!("Malformed document: {e}")))?;

    if file.version != EXPORT_VERSION {
        return Err(Error::InvalidImport(format!(
            "Unsupported export version: {}",
            file.version
        )));
    }
    for todo in &mut file.todos {
        todo.recount();
    }
    validate_file(&file)?;
    Ok(file)
}

fn validate_file(file: &ExportFile) -> Result<()> {
    for note in &file.notes {
        note.validate()
            .map_err(|e| Error::InvalidImport(format!("Note {}: {e}", note.id)))?;
    }
    for todo in &file.todos {
        todo.validate()
            .map_err(|e| Error::InvalidImport(format!("Todo {}: {e}", todo.id)))?;
    }
    Ok(())
}

/// Apply an export document to this device
///
/// Each record is matched against the local copy with the same id and the
/// strategy decides which survives: `merge` runs last-write-wins with the
/// file playing the remote role (so an exact tie takes the file's copy),
/// `replace` takes the file's copy unconditionally and `skip` keeps the
/// local copy unconditionally. Ids not present locally are created under
/// every strategy. Settings are replaced only by `replace`. Applied
/// records keep the file's timestamps.
pub async fn import(
    coordinator: &SyncCoordinator,
    file: ExportFile,
    strategy: ImportStrategy,
) -> Result<ImportSummary> {
    validate_file(&file)?;

    let mut summary = ImportSummary::default();
    let incoming = file
        .notes
        .into_iter()
        .map(Entity::Note)
        .chain(file.todos.into_iter().map(Entity::Todo));

    for entity in incoming {
        let existing = coordinator.store().get(entity.collection(), entity.id())?;
        match existing {
            None => {
                coordinator.apply(Mutation::Create(entity)).await?;
                summary.created += 1;
            }
            Some(local) => {
                let file_wins = match strategy {
                    ImportStrategy::Merge => {
                        resolver::resolve(&local, &entity) == ConflictWinner::Remote
                    }
                    ImportStrategy::Replace => true,
                    ImportStrategy::Skip => false,
                };
                if file_wins {
                    coordinator.apply(Mutation::Update(entity)).await?;
                    summary.updated += 1;
                } else {
                    summary.skipped += 1;
                }
            }
        }
    }

    if strategy == ImportStrategy::Replace {
        coordinator.store().save_settings(&file.settings)?;
        summary.settings_replaced = true;
    }
    Ok(summary)
}
