//! Transport abstraction for the excluded networking/security layer.

use tokio::io::{AsyncRead, AsyncWrite};

/// An established transport-level connection.
///
/// Produced by the networking/security collaborator (TCP, TLS, named pipes)
/// and consumed opaquely by this crate: the session layer only frames,
/// sequences and flow-controls bytes over it.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A type-erased transport, as handed over by a connection opener.
pub type BoxedTransport = Box<dyn Transport>;
