//! Client commands and server responses.

use crate::patch::Version;
use mdir_codec::Header;
use std::fmt;

/// Sequence number correlating a request with its response.
pub type Seq = u64;

/// Status code of a successful command.
pub const STATUS_OK: u16 = 200;
/// The request could not be understood.
pub const STATUS_BAD_REQUEST: u16 = 400;
/// The user may not subscribe to the folder.
pub const STATUS_FORBIDDEN: u16 = 403;
/// The folder or version does not exist.
pub const STATUS_NOT_FOUND: u16 = 404;
/// A competing creation won; re-resolve by name.
pub const STATUS_CONFLICT: u16 = 409;
/// The server failed while handling the request.
pub const STATUS_SERVER_ERROR: u16 = 500;

/// The kind of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    /// Subscribe to a folder's patches.
    Sub,
    /// Stop receiving a folder's patches.
    Unsub,
    /// Append a document to a folder.
    Put,
    /// Remove a document from a folder.
    Rem,
    /// End the session.
    Quit,
}

impl CommandKind {
    /// Wire keyword.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            CommandKind::Sub => "SUB",
            CommandKind::Unsub => "UNSUB",
            CommandKind::Put => "PUT",
            CommandKind::Rem => "REM",
            CommandKind::Quit => "QUIT",
        }
    }

    /// Parses a wire keyword.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "SUB" => Some(CommandKind::Sub),
            "UNSUB" => Some(CommandKind::Unsub),
            "PUT" => Some(CommandKind::Put),
            "REM" => Some(CommandKind::Rem),
            "QUIT" => Some(CommandKind::Quit),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A request sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Subscribe to `dir_id`, receiving every patch after `from_version`.
    Sub {
        /// Sequence number.
        seq: Seq,
        /// Folder.
        dir_id: String,
        /// Version the client already has.
        from_version: Version,
    },
    /// Unsubscribe from `dir_id`.
    Unsub {
        /// Sequence number.
        seq: Seq,
        /// Folder.
        dir_id: String,
    },
    /// Append `header` to `dir_id`.
    Put {
        /// Sequence number.
        seq: Seq,
        /// Folder.
        dir_id: String,
        /// Document to add.
        header: Header,
    },
    /// Remove the document committed at `version` in `dir_id`.
    Rem {
        /// Sequence number.
        seq: Seq,
        /// Folder.
        dir_id: String,
        /// Version of the document to remove.
        version: Version,
    },
    /// End the session.
    Quit {
        /// Sequence number.
        seq: Seq,
    },
}

impl Request {
    /// Sequence number of the request.
    #[must_use]
    pub fn seq(&self) -> Seq {
        match self {
            Request::Sub { seq, .. }
            | Request::Unsub { seq, .. }
            | Request::Put { seq, .. }
            | Request::Rem { seq, .. }
            | Request::Quit { seq } => *seq,
        }
    }

    /// Kind of the request.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Request::Sub { .. } => CommandKind::Sub,
            Request::Unsub { .. } => CommandKind::Unsub,
            Request::Put { .. } => CommandKind::Put,
            Request::Rem { .. } => CommandKind::Rem,
            Request::Quit { .. } => CommandKind::Quit,
        }
    }

    /// Folder the request addresses, if any.
    #[must_use]
    pub fn dir_id(&self) -> Option<&str> {
        match self {
            Request::Sub { dir_id, .. }
            | Request::Unsub { dir_id, .. }
            | Request::Put { dir_id, .. }
            | Request::Rem { dir_id, .. } => Some(dir_id),
            Request::Quit { .. } => None,
        }
    }
}

/// A response to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Sequence number of the request answered.
    pub seq: Seq,
    /// Numeric status; 200 is success.
    pub status: u16,
    /// Optional free text.
    pub text: Option<String>,
}

impl Response {
    /// A bare success.
    #[must_use]
    pub fn ok(seq: Seq) -> Self {
        Self {
            seq,
            status: STATUS_OK,
            text: None,
        }
    }

    /// A success carrying text.
    #[must_use]
    pub fn ok_with(seq: Seq, text: impl Into<String>) -> Self {
        Self {
            seq,
            status: STATUS_OK,
            text: Some(text.into()),
        }
    }

    /// A failure.
    #[must_use]
    pub fn error(seq: Seq, status: u16, text: impl Into<String>) -> Self {
        Self {
            seq,
            status,
            text: Some(text.into()),
        }
    }

    /// Success answer to a PUT.
    ///
    /// The text is the committed version, followed by the folder identifier
    /// when the document was a directory entry.
    #[must_use]
    pub fn put_ok(seq: Seq, ack: &PutAck) -> Self {
        let text = match &ack.dir_id {
            Some(dir_id) => format!("{} {dir_id}", ack.version),
            None => ack.version.to_string(),
        };
        Self::ok_with(seq, text)
    }

    /// Returns true for status 200.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Parses the text of a PUT success.
    #[must_use]
    pub fn put_ack(&self) -> Option<PutAck> {
        let text = self.text.as_deref()?;
        let mut parts = text.split_whitespace();
        let version = parts.next()?.parse().ok()?;
        let dir_id = parts.next().map(str::to_string);
        Some(PutAck { version, dir_id })
    }
}

/// What a successful PUT committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutAck {
    /// Version at which the document now lives.
    pub version: Version,
    /// Durable identifier, for directory entries.
    pub dir_id: Option<String>,
}
