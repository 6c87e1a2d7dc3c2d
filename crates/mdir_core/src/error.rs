//! Error types for mdir core.

use crate::types::DirId;
use mdir_protocol::Version;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in mdir core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] mdir_storage::StorageError),

    /// Document codec error.
    #[error("codec error: {0}")]
    Codec(#[from] mdir_codec::CodecError),

    /// Protocol type error.
    #[error("protocol error: {0}")]
    Protocol(#[from] mdir_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON metadata file could not be read or written.
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// The journal is corrupted or invalid.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// An append was attempted on top of the wrong version.
    #[error("version conflict: expected {expected}, folder is at {actual}")]
    VersionConflict {
        /// Version the caller expected.
        expected: Version,
        /// Version the folder is actually at.
        actual: Version,
    },

    /// A REMOVE targets a version that holds no live document.
    #[error("no live document at version {version} in folder {dir_id}")]
    DocumentNotFound {
        /// Folder searched.
        dir_id: DirId,
        /// Targeted version.
        version: Version,
    },

    /// A document exceeds the configured size limit.
    #[error("document of {size} bytes exceeds limit of {limit} bytes")]
    DocumentTooLarge {
        /// Encoded size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A transient identifier was about to leave the client.
    #[error("transient folder identifier {0} cannot be shared")]
    TransientIdLeak(DirId),

    /// A path inside the mirror is not usable.
    #[error("invalid path {path}: {message}")]
    InvalidPath {
        /// The path.
        path: PathBuf,
        /// Why it was refused.
        message: String,
    },

    /// Invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description.
        message: String,
    },
}

impl CoreError {
    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if the error means stored data cannot be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::JournalCorruption { .. } | Self::ChecksumMismatch { .. }
        )
    }
}
