use std::fmt;

use crate::connection::EntryId;
use crate::handler::Handler;
use crate::protocol::{ClientError, RequestDescriptor};

/// Messages from client handles to the connection task.
pub(crate) enum Command {
    /// Queue an accepted request
    Dispatch { request: RequestDescriptor, handler: Box<dyn Handler> },
    /// Cancel a request; stale ids are ignored
    Abort { id: EntryId, reason: Option<String> },
    /// Continue delivery to a paused handler
    Resume { id: EntryId },
    /// Finish queued requests, then close
    Close,
    /// Fail every request with the error and close now
    Destroy(ClientError),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Dispatch { request, .. } => f.debug_struct("Dispatch").field("request", request).finish_non_exhaustive(),
            Command::Abort { id, reason } => f.debug_struct("Abort").field("id", id).field("reason", reason).finish(),
            Command::Resume { id } => f.debug_struct("Resume").field("id", id).finish(),
            Command::Close => f.write_str("Close"),
            Command::Destroy(e) => f.debug_tuple("Destroy").field(e).finish(),
        }
    }
}
