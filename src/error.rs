//! Error types for store operations.

use std::io;

use thiserror::Error;

/// Errors surfaced by the rock store.
///
/// Contention is not an error: a busy slot surfaces as `None` or `false`
/// from the directory, never as a `RockError`.
#[derive(Debug, Error)]
pub enum RockError {
    /// Configuration rejected before any request was served.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The shared directory segment could not be created.
    #[error("shared segment create failed: {0}")]
    ShmCreate(#[source] io::Error),

    /// The shared directory segment could not be attached.
    #[error("shared segment attach failed: {0}")]
    ShmAttach(#[source] io::Error),

    /// The backing db file could not be created.
    #[error("db file create failed: {0}")]
    FileCreate(#[source] io::Error),

    /// The backing db file could not be opened.
    #[error("db file open failed: {0}")]
    FileOpen(#[source] io::Error),

    /// The backing db file could not be sized.
    #[error("db file truncate failed: {0}")]
    FileTruncate(#[source] io::Error),

    /// An asynchronous read or write failed.
    #[error("disk i/o failed: {0}")]
    Io(#[from] io::Error),

    /// A cell failed validation during rebuild.
    #[error("corrupt cell {fileno}: {reason}")]
    Corruption {
        /// The cell that failed validation.
        fileno: u32,
        /// Why the cell was rejected.
        reason: &'static str,
    },

    /// A write reported no space left on the fixed-size db file.
    #[error("no space left on db file")]
    DiskFull,
}

/// Result type for store operations.
pub type RockResult<T> = Result<T, RockError>;
