//! SMUX protocol error types.

use thiserror::Error;

/// Errors produced while decoding SMUX header bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too short to contain a full header.
    #[error("incomplete SMUX header: expected {expected} bytes, got {actual}")]
    IncompleteHeader {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// First byte was not the SMUX protocol identifier.
    #[error("invalid SMUX protocol id: 0x{0:02X}")]
    InvalidProtocolId(u8),

    /// Flags byte contained unknown bits.
    #[error("invalid SMUX flags: 0x{0:02X}")]
    InvalidFlags(u8),

    /// Total length field smaller than the header itself.
    #[error("invalid SMUX frame length: {0}")]
    InvalidLength(u32),
}
