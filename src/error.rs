// src/error.rs

use thiserror::Error;

/// Broad classification of an [`Error`], used by callers that only need to
/// know which family a failure belongs to (e.g. to pick an HTTP status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Storage,
    Signing,
    Internal,
}

/// Core error types for debpool
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown entity, task or package
    #[error("{0}")]
    NotFound(String),

    /// Duplicate name, incompatible state or duplicate publish target
    #[error("{0}")]
    Conflict(String),

    /// Malformed request, missing field or unknown source kind
    #[error("{0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Encoding or decoding of stored values failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Remote fetch failed
    #[error("Download error: {0}")]
    Download(String),

    /// Index or control file could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// File content does not match the recorded checksum
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// External signer unavailable or failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Task cannot start immediately because resources are held
    #[error("Unable to start task, resources are in use by tasks {}", format_task_ids(.tasks))]
    ResourceConflict { tasks: Vec<u64> },

    /// Operation observed its cancellation signal or deadline
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_task_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Classify the error into the taxonomy callers reason about
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) | Error::DatabaseNotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) | Error::ResourceConflict { .. } => ErrorKind::Conflict,
            Error::Validation(_) | Error::ParseError(_) => ErrorKind::Validation,
            Error::Io(_)
            | Error::Database(_)
            | Error::Serialization(_)
            | Error::InitError(_)
            | Error::Download(_)
            | Error::ChecksumMismatch { .. } => ErrorKind::Storage,
            Error::Signing(_) => ErrorKind::Signing,
            Error::Cancelled(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias using debpool's Error type
pub type Result<T> = std::result::Result<T, Error>;
