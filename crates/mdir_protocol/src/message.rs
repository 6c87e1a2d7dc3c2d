//! Messages flowing from server to client.

use crate::command::Response;
use crate::patch::Patch;

/// One message on the server-to-client stream.
///
/// Responses and patch announcements share the single connection; the
/// client's reader demultiplexes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Answer to a request.
    Response(Response),
    /// A patch committed to a subscribed folder.
    Patch {
        /// Folder the patch belongs to.
        dir_id: String,
        /// The patch.
        patch: Patch,
    },
}

impl From<Response> for ServerMessage {
    fn from(response: Response) -> Self {
        ServerMessage::Response(response)
    }
}
