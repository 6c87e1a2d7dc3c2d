//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding a header document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// CBOR serialization failed.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// CBOR bytes could not be decoded into a header.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A text line is not of the form `name: value`.
    #[error("malformed field line {line}: {message}")]
    MalformedLine {
        /// 1-based line number inside the document.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// A field name is empty or contains `:` or whitespace.
    #[error("invalid field name {0:?}")]
    InvalidFieldName(String),

    /// A value carries an escape sequence we do not know.
    #[error("invalid escape sequence \\{0}")]
    InvalidEscape(char),
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create a malformed line error.
    pub fn malformed_line(line: usize, message: impl Into<String>) -> Self {
        Self::MalformedLine {
            line,
            message: message.into(),
        }
    }
}
