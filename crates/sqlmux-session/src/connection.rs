//! Physical connection: one transport-level connection, optionally hosting
//! a session multiplexer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use smux_codec::DEFAULT_MAX_FRAME_SIZE;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{SessionError, TransportError};
use crate::multiplexer::SessionMultiplexer;
use crate::session::Session;
use crate::transport::BoxedTransport;

/// Monotonic source for connection ids, for log correlation.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const DIRECT_READ_CHUNK: usize = 8 * 1024;

/// Multiplexing parameters for a physical connection.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct MuxSettings {
    /// Un-acknowledged deliveries tolerated before a dedicated ACK is sent.
    pub ack_threshold: u32,
    /// Initial send and receive window, in frames.
    pub initial_window: u32,
    /// Largest frame (header plus payload) accepted or produced.
    pub max_frame_size: usize,
}

impl MuxSettings {
    /// Settings with the protocol defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ack_threshold: 2,
            initial_window: 4,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the ACK threshold.
    #[must_use]
    pub fn with_ack_threshold(mut self, threshold: u32) -> Self {
        self.ack_threshold = threshold;
        self
    }

    /// Set the initial flow-control window.
    #[must_use]
    pub fn with_initial_window(mut self, window: u32) -> Self {
        self.initial_window = window.max(1);
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self::new()
    }
}

enum Mode {
    /// Exclusive use: the owner reads and writes raw bytes itself.
    Direct {
        io: tokio::sync::Mutex<BoxedTransport>,
    },
    /// Shared use through the session multiplexer.
    Multiplexed { mux: SessionMultiplexer },
}

/// One established transport-level connection.
///
/// Pooled and handed out by the pooling layer. A direct connection belongs
/// to a single logical owner at a time; a multiplexed one hosts any number
/// of concurrent [`Session`]s.
pub struct PhysicalConnection {
    id: u64,
    broken: AtomicBool,
    /// Current logical owner, for diagnostics only.
    owner: parking_lot::Mutex<Option<u64>>,
    mode: Mode,
}

impl PhysicalConnection {
    /// Wrap a transport for exclusive (non-multiplexed) use.
    #[must_use]
    pub fn direct(transport: BoxedTransport) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            broken: AtomicBool::new(false),
            owner: parking_lot::Mutex::new(None),
            mode: Mode::Direct {
                io: tokio::sync::Mutex::new(transport),
            },
        }
    }

    /// Wrap a transport and start a session multiplexer on it.
    ///
    /// Must be called within a tokio runtime; the multiplexer spawns the
    /// inbound dispatch task immediately.
    #[must_use]
    pub fn multiplexed(transport: BoxedTransport, settings: MuxSettings) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            broken: AtomicBool::new(false),
            owner: parking_lot::Mutex::new(None),
            mode: Mode::Multiplexed {
                mux: SessionMultiplexer::start(transport, settings),
            },
        }
    }

    /// Process-unique connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this connection hosts a session multiplexer.
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        matches!(self.mode, Mode::Multiplexed { .. })
    }

    /// Whether the connection has been marked unusable.
    ///
    /// A broken connection is destroyed on release instead of returning to
    /// its pool.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        if self.broken.load(Ordering::Acquire) {
            return true;
        }
        match &self.mode {
            Mode::Direct { .. } => false,
            Mode::Multiplexed { mux } => mux.is_broken(),
        }
    }

    /// Mark the connection unusable.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Record the logical owner, for log correlation.
    pub fn set_owner(&self, owner: Option<u64>) {
        *self.owner.lock() = owner;
    }

    /// Current logical owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<u64> {
        *self.owner.lock()
    }

    /// The session multiplexer, when multiplexing is enabled.
    #[must_use]
    pub fn multiplexer(&self) -> Option<&SessionMultiplexer> {
        match &self.mode {
            Mode::Direct { .. } => None,
            Mode::Multiplexed { mux } => Some(mux),
        }
    }

    /// Open a new logical session on a multiplexed connection.
    pub async fn open_session(&self) -> Result<Session, SessionError> {
        if self.broken.load(Ordering::Acquire) {
            return Err(SessionError::Terminated("connection is broken".into()));
        }
        match &self.mode {
            Mode::Direct { .. } => Err(SessionError::Protocol(
                "connection is not multiplexed".into(),
            )),
            Mode::Multiplexed { mux } => mux.open_session().await,
        }
    }

    /// Write raw bytes on a direct connection.
    pub async fn send_bytes(&self, payload: &[u8]) -> Result<(), TransportError> {
        let Mode::Direct { io } = &self.mode else {
            return Err(TransportError::Failed(
                "raw I/O is unavailable on a multiplexed connection".into(),
            ));
        };
        let mut transport = io.lock().await;
        if let Err(error) = transport.write_all(payload).await {
            self.mark_broken();
            return Err(error.into());
        }
        transport.flush().await.map_err(|error| {
            self.mark_broken();
            TransportError::from(error)
        })
    }

    /// Read the next chunk of raw bytes on a direct connection.
    pub async fn recv_bytes(&self) -> Result<Bytes, TransportError> {
        let Mode::Direct { io } = &self.mode else {
            return Err(TransportError::Failed(
                "raw I/O is unavailable on a multiplexed connection".into(),
            ));
        };
        let mut transport = io.lock().await;
        let mut buf = BytesMut::with_capacity(DIRECT_READ_CHUNK);
        match transport.read_buf(&mut buf).await {
            Ok(0) => {
                self.mark_broken();
                Err(TransportError::Closed)
            }
            Ok(_) => Ok(buf.freeze()),
            Err(error) => {
                self.mark_broken();
                Err(error.into())
            }
        }
    }
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("id", &self.id)
            .field("multiplexed", &self.is_multiplexed())
            .field("broken", &self.is_broken())
            .field("owner", &self.owner())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn direct_pair() -> (PhysicalConnection, PhysicalConnection) {
        let (a, b) = tokio::io::duplex(4096);
        (
            PhysicalConnection::direct(Box::new(a)),
            PhysicalConnection::direct(Box::new(b)),
        )
    }

    #[tokio::test]
    async fn test_direct_send_recv() {
        let (client, server) = direct_pair();

        client.send_bytes(b"select 1").await.unwrap();
        let bytes = server.recv_bytes().await.unwrap();
        assert_eq!(&bytes[..], b"select 1");
    }

    #[tokio::test]
    async fn test_direct_peer_close_marks_broken() {
        let (client, server) = direct_pair();
        drop(client);

        let err = server.recv_bytes().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(server.is_broken());
    }

    #[tokio::test]
    async fn test_open_session_on_direct_fails() {
        let (client, _server) = direct_pair();

        let err = client.open_session().await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, b) = direct_pair();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_owner_tag() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = PhysicalConnection::direct(Box::new(a));
        assert_eq!(conn.owner(), None);
        conn.set_owner(Some(7));
        assert_eq!(conn.owner(), Some(7));
        conn.set_owner(None);
        assert_eq!(conn.owner(), None);
    }
}
