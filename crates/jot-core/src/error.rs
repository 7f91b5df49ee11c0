//! Error types for jot-core

use thiserror::Error;

/// Result type alias using jot-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in jot-core operations
///
/// Remote transport failures are deliberately absent here: they are absorbed
/// into the sync queue and never surfaced through engine calls. See
/// `sync::remote::RemoteError` for that side.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input, rejected before reaching any store
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Import document failed schema validation; nothing was applied
    #[error("Invalid import: {0}")]
    InvalidImport(String),
}
