//! # sqlmux-session
//!
//! Session multiplexing over a shared physical connection (the MARS layer).
//!
//! A [`PhysicalConnection`] wraps one transport-level connection. When
//! multiplexing is enabled it hosts a [`SessionMultiplexer`], which lets many
//! independent logical request/response streams ([`Session`]) share the
//! transport through a small framing sub-protocol with explicit flow control:
//!
//! - every DATA frame consumes exactly one send sequence number;
//! - a session may not send past the peer-advertised highwater mark and
//!   blocks (or queues) until an ACK raises it;
//! - received frames raise the local highwater on delivery, and an ACK is
//!   emitted once enough un-acknowledged deliveries accumulate.
//!
//! The multiplexer runs one inbound dispatch loop per physical connection,
//! preserving per-session FIFO delivery. Payload bytes are opaque here;
//! framing, sequencing and flow control are this crate's whole job.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod session;
pub mod transport;

pub use connection::{MuxSettings, PhysicalConnection};
pub use error::{SessionError, TransportError};
pub use multiplexer::SessionMultiplexer;
pub use session::{SendStatus, Session};
pub use transport::{BoxedTransport, Transport};
