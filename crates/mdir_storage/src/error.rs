//! Error types for log backends.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a [`crate::LogBackend`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read reached past the end of the log.
    #[error("read beyond end of log: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current log size.
        size: u64,
    },

    /// A truncation asked to grow the log.
    #[error("cannot truncate log of {size} bytes to {requested} bytes")]
    TruncateBeyondEnd {
        /// The requested length.
        requested: u64,
        /// The current log size.
        size: u64,
    },

    /// Another process holds the log's lock file.
    #[error("journal locked by another process: {}", path.display())]
    Locked {
        /// The lock file that could not be acquired.
        path: PathBuf,
    },
}
