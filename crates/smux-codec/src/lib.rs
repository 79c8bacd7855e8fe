//! # smux-codec
//!
//! Async framing layer for SMUX multiplexing frames.
//!
//! This crate transforms raw byte streams into complete SMUX frames,
//! handling frame reassembly across TCP segment boundaries. It sits between
//! the transport and the session layer:
//!
//! ```text
//! Transport → SmuxCodec (frame framing) → SessionMultiplexer → Sessions
//! ```
//!
//! The read and write halves are split (`FrameReader` / `FrameWriter`) so a
//! single inbound dispatch loop can keep reading while any session writes
//! through the shared writer.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod frame_codec;
pub mod framed;

pub use error::CodecError;
pub use frame_codec::{DEFAULT_MAX_FRAME_SIZE, Frame, SmuxCodec};
pub use framed::{FrameReader, FrameWriter};
