//! Errors surfaced by link and manager operations.

use std::io;

use crate::queue::QueueError;

/// Error returned by link, manager and relay operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The outbound queue is blocked behind a close request.
    #[error("outbound queue is blocked")]
    QueueBlocked,
    #[error("connection is closed")]
    ConnectionClosed,
    /// The peer sent something that does not fit the current exchange.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The operation is not available in the manager's current mode.
    #[error("not available in {0} mode")]
    WrongMode(&'static str),
    #[error("connection to {0} declined")]
    Declined(String),
    #[error("receiver {0} is not known to the relay")]
    ReceiverNotKnown(String),
    #[error("timed out")]
    Timeout,
}

impl From<QueueError> for LinkError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Blocked => LinkError::QueueBlocked,
            // Only reachable if a caller pops through the link API.
            QueueError::Empty => LinkError::UnexpectedResponse("empty queue".into()),
        }
    }
}
