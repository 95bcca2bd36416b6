//! Error types for connection establishment, pooling and acquisition.

use std::io;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connection establishment, pooling and acquisition.
///
/// Protocol-level narrative (the server's own wording, authentication
/// details and so on) is not encoded here; it is carried by the failing
/// connection's error context, see [`Connection::error_context`].
///
/// [`Connection::error_context`]: crate::Connection::error_context
#[derive(Debug, Error)]
pub enum Error {
    /// The protocol engine refused to begin connecting (bad conninfo,
    /// address resolution failure, socket creation failure).
    #[error("connection establishment could not be started")]
    ConnectionStartFailed,

    /// The connection socket could not be registered with the reactor.
    #[error("connection socket could not be registered with the reactor")]
    AssignSocketFailed,

    /// The connection is in a bad state and cannot perform operations.
    #[error("connection is in a bad state")]
    ConnectionStatusBad,

    /// The establishment handshake reported failure while polling.
    #[error("connection establishment polling failed")]
    ConnectPollFailed,

    /// The operation requires an idle connection but waits are outstanding.
    #[error("connection is busy with outstanding waits")]
    BusyConnection,

    /// An outstanding wait was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A deadline expired before the operation completed.
    #[error("operation timed out")]
    TimedOut,

    /// The pool wait-queue deadline expired before a connection freed up.
    #[error("timed out waiting for a pooled connection")]
    QueueTimeout,

    /// The pool wait queue is at capacity.
    #[error("pool wait queue is full")]
    QueueOverflow,

    /// A reactor-level I/O error, passed through verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::QueueOverflow.to_string(), "pool wait queue is full");
        assert_eq!(Error::TimedOut.to_string(), "operation timed out");
    }
}
