//! Codec error types.

use smux_protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur while framing SMUX frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame header.
    #[error("invalid SMUX header: {0}")]
    InvalidHeader(#[from] ProtocolError),

    /// Frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Claimed frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Connection closed mid-frame.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,
}
