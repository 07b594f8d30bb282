//! Error types for usenet-writer
//!
//! This module provides error handling for the library:
//! - A top-level [`Error`] used by public entry points
//! - [`DatabaseError`] for the runtime-state store
//! - [`WriteError`] for disk operations of the segment writer and file assembly
//!
//! Most failures inside the writer are not propagated to callers at all: they are
//! recorded on the owning download's message log and the affected segment or file
//! is marked failed. The types here cover the cases where a caller needs a status.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for usenet-writer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-writer
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "temp_dir")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Disk write path failed
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Errors of the disk write path (segment placement, drain, completion)
#[derive(Debug, Error)]
pub enum WriteError {
    /// Directory could not be created
    #[error("could not create directory {path}: {reason}")]
    CreateDirectory {
        /// The directory that could not be created
        path: PathBuf,
        /// The reason creation failed
        reason: String,
    },

    /// File could not be created
    #[error("could not create file {path}: {source}")]
    CreateFile {
        /// The file that could not be created
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Existing file could not be opened
    #[error("could not open file {path}: {source}")]
    OpenFile {
        /// The file that could not be opened
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Write into a file failed
    #[error("could not write file {path}: {source}")]
    WriteFile {
        /// The file being written
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Pre-allocation of the direct-write artifact failed
    #[error("could not allocate {size} bytes for {path}: {reason}")]
    Allocate {
        /// The file being allocated
        path: PathBuf,
        /// Requested size in bytes
        size: u64,
        /// The reason allocation failed
        reason: String,
    },

    /// File move/rename failed
    #[error("could not move {source_path} to {dest_path}: {reason}")]
    MoveFailed {
        /// The source path of the file being moved
        source_path: PathBuf,
        /// The destination path where the file should be moved
        dest_path: PathBuf,
        /// The reason the move failed
        reason: String,
    },

    /// No free destination name could be found
    #[error("file collision at {path}: {reason}")]
    FileCollision {
        /// The path where the collision occurred
        path: PathBuf,
        /// The reason for the collision
        reason: String,
    },

    /// Article index outside the file's article list
    #[error("file {file_id} has no article at index {index}")]
    UnknownArticle {
        /// The file
        file_id: crate::types::FileId,
        /// The requested article index
        index: usize,
    },

    /// Writer used out of order (e.g. `write` before `start`)
    #[error("segment writer is not started")]
    NotStarted,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_converts_into_top_level_error() {
        let err: Error = WriteError::CreateDirectory {
            path: PathBuf::from("/dest/show"),
            reason: "permission denied".to_string(),
        }
        .into();

        assert!(matches!(err, Error::Write(WriteError::CreateDirectory { .. })));
        assert_eq!(
            err.to_string(),
            "write error: could not create directory /dest/show: permission denied"
        );
    }

    #[test]
    fn move_failed_message_names_both_paths() {
        let err = WriteError::MoveFailed {
            source_path: PathBuf::from("/tmp/a.tmp"),
            dest_path: PathBuf::from("/dest/a.bin"),
            reason: "cross-device link".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("/tmp/a.tmp"));
        assert!(msg.contains("/dest/a.bin"));
        assert!(msg.contains("cross-device link"));
    }

    #[test]
    fn io_error_converts_into_top_level_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
