//! Error types for fieldlog-store.

use std::path::PathBuf;

/// Result type for fieldlog-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldlog-store.
///
/// Every variant means the buffer can no longer guarantee that undelivered
/// records survive, so callers treat them as fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to create the buffer directory.
    #[error("Failed to create buffer directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to open or recover the buffer file.
    #[error("Failed to open buffer file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to append a record.
    #[error("Failed to append to buffer file {path}: {source}")]
    Append {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to read the buffer contents.
    #[error("Failed to read buffer file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to rewrite the buffer after a delivered snapshot.
    #[error("Failed to commit buffer file {path}: {source}")]
    Commit {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The snapshot no longer matches the start of the buffer file.
    #[error("Snapshot of {lines} line(s) no longer matches the head of {path}")]
    StaleSnapshot { path: PathBuf, lines: usize },
}
