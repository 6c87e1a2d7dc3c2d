//! Error types for the sync client.

use mdir_core::CoreError;
use mdir_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed message on the connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Folder, journal or mirror error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Folder tree file could not be read or written.
    #[error("tree error: {0}")]
    Tree(#[from] serde_json::Error),

    /// The server rejected a command.
    #[error("command {seq} rejected with status {status}")]
    Rejected {
        /// Sequence number of the command.
        seq: u64,
        /// Status code.
        status: u16,
    },

    /// A tree path does not resolve to a folder.
    #[error("no folder at {path:?}")]
    UnknownFolder {
        /// The path.
        path: String,
    },

    /// A tree path or folder name is not usable.
    #[error("invalid folder path {path:?}: {message}")]
    InvalidPath {
        /// The path.
        path: String,
        /// Why it was refused.
        message: String,
    },

    /// An unconfirmed folder would be linked from a second place.
    #[error("transient folder {dir_id} is already linked at {existing:?}")]
    DiamondLink {
        /// The transient identifier.
        dir_id: String,
        /// Path already linking it.
        existing: String,
    },

    /// Content store failure.
    #[error("content store error: {0}")]
    Content(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Io(_) | SyncError::NotConnected => true,
            _ => false,
        }
    }
}
