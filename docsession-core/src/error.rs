//! Error types for docsession-core

use std::path::PathBuf;

use docsession_types::SessionId;
use thiserror::Error;

/// Failures raised by a document engine while loading or saving.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("failed to save {path}: {reason}")]
    Save { path: PathBuf, reason: String },

    #[error("document is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Session lifecycle errors surfaced at the registry boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown id, or an id the requestor is not allowed to see.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The handle was torn down before or while the caller waited for it.
    #[error("session {0} has been disposed")]
    Disposed(SessionId),

    #[error("maximum number of open sessions reached ({max})")]
    CapacityExceeded { max: usize },

    #[error("file too large: {path} is {size_bytes} bytes (limit {limit_mb} MB)")]
    FileTooLarge {
        path: PathBuf,
        size_bytes: u64,
        limit_mb: u64,
    },

    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported document type: {0}")]
    UnsupportedDocumentType(PathBuf),

    #[error("session {0} was opened read-only and cannot be saved")]
    ReadonlySessionWriteAttempt(SessionId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("sessions are disabled")]
    Disabled,

    #[error("wait for session {0} was cancelled")]
    Cancelled(SessionId),

    #[error("corrupt recovery metadata at {path}: {reason}")]
    MetadataCorrupt { path: PathBuf, reason: String },

    #[error("snapshot missing: {0}")]
    SnapshotMissing(PathBuf),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;
