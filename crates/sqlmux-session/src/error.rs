//! Session-layer error types.

use thiserror::Error;

/// Errors from establishing or using a transport connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport closed by the peer.
    #[error("transport closed")]
    Closed,

    /// Establishment or use failed for a non-I/O reason.
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Errors reported by multiplexed session operations.
///
/// `Clone` because a terminal connection error is broadcast to every open
/// session on the physical connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A receive (or send) wait exceeded its caller-specified timeout.
    /// Local to that call; session state stays consistent for a retry.
    #[error("session operation timed out")]
    Timeout,

    /// The owning physical connection failed. All sessions on it report
    /// this on next access; the caller must re-acquire a new connection.
    #[error("session terminated: {0}")]
    Terminated(String),

    /// The session was closed, locally or by a peer FIN.
    #[error("session closed")]
    Closed,

    /// Malformed or out-of-window frame observed. Fatal to the physical
    /// connection, since correctness cannot be guaranteed past this point.
    #[error("protocol violation: {0}")]
    Protocol(String),
}
