//! Error types for the sync server.

use mdir_core::CoreError;
use mdir_protocol::{
    ProtocolError, STATUS_BAD_REQUEST, STATUS_CONFLICT, STATUS_FORBIDDEN, STATUS_NOT_FOUND,
    STATUS_SERVER_ERROR,
};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The user may not subscribe to the folder.
    #[error("user {user:?} may not access folder {dir_id}")]
    Forbidden {
        /// Requesting user.
        user: String,
        /// Folder asked for.
        dir_id: String,
    },

    /// The creation policy refused a duplicate folder name.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Folder or journal error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Malformed traffic.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Status code answering a command that failed with this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => STATUS_BAD_REQUEST,
            ServerError::Forbidden { .. } => STATUS_FORBIDDEN,
            ServerError::Conflict(_) => STATUS_CONFLICT,
            ServerError::Core(CoreError::DocumentNotFound { .. }) => STATUS_NOT_FOUND,
            ServerError::Core(
                CoreError::DocumentTooLarge { .. }
                | CoreError::TransientIdLeak(_)
                | CoreError::InvalidArgument { .. },
            ) => STATUS_BAD_REQUEST,
            ServerError::Core(_) | ServerError::Io(_) => STATUS_SERVER_ERROR,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdir_core::DirId;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Io(std::io::Error::other("disk")).is_server_error());
        assert!(!ServerError::Conflict("dup".into()).is_server_error());
    }

    #[test]
    fn status_codes() {
        let missing = ServerError::from(CoreError::DocumentNotFound {
            dir_id: DirId::new("3"),
            version: 9,
        });
        assert_eq!(missing.status_code(), STATUS_NOT_FOUND);
        let forbidden = ServerError::Forbidden {
            user: "mallory".into(),
            dir_id: "3".into(),
        };
        assert_eq!(forbidden.status_code(), STATUS_FORBIDDEN);
        assert_eq!(ServerError::Conflict("x".into()).status_code(), STATUS_CONFLICT);
        let corrupt = ServerError::from(CoreError::journal_corruption("bad magic"));
        assert_eq!(corrupt.status_code(), STATUS_SERVER_ERROR);
    }
}
