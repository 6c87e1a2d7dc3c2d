//! Protocol errors.

use mdir_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or parsing protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A document line failed to encode or decode.
    #[error("document error: {0}")]
    Codec(#[from] CodecError),

    /// The keyword of a message is not one we know.
    #[error("unknown message keyword {0:?}")]
    UnknownKeyword(String),

    /// A message line has the wrong shape.
    #[error("malformed message {line:?}: {message}")]
    Malformed {
        /// The offending line.
        line: String,
        /// What was wrong with it.
        message: String,
    },

    /// A patch whose new version is not after its old version.
    #[error("invalid version span {old} -> {new}")]
    InvalidVersionSpan {
        /// Claimed old version.
        old: i64,
        /// Claimed new version.
        new: i64,
    },

    /// An action code other than `a` or `r`.
    #[error("invalid action code {0:?}")]
    InvalidAction(String),

    /// A folder identifier that cannot travel on the wire.
    #[error("invalid folder identifier {0:?}")]
    InvalidDirId(String),

    /// A line grew past the decoder limit without a terminator.
    #[error("line exceeds {limit} bytes")]
    LineTooLong {
        /// The configured limit.
        limit: usize,
    },

    /// Bytes that are not UTF-8.
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Create a malformed message error.
    pub fn malformed(line: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            line: line.into(),
            message: message.into(),
        }
    }

    /// Returns true if the stream cannot be resynchronized after this error
    /// (the offending bytes were not consumed).
    #[must_use]
    pub fn is_stream_fatal(&self) -> bool {
        matches!(self, Self::LineTooLong { .. } | Self::InvalidUtf8)
    }
}
