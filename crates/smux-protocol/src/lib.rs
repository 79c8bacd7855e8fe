//! # smux-protocol
//!
//! Wire layout for the SMUX session-multiplexing sub-protocol.
//!
//! SMUX lets many logical request/response streams share one physical
//! connection. Each framed unit on the wire starts with a fixed 16-byte
//! header carrying the session id, a per-session sequence number, and a
//! flow-control highwater mark. This crate only defines the header types
//! and their encoding; async framing lives in `smux-codec` and session
//! semantics in `sqlmux-session`.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod header;

pub use error::ProtocolError;
pub use header::{SMUX_HEADER_SIZE, SMUX_PROTOCOL_ID, SmuxFlags, SmuxHeader};
