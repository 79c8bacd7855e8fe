//! Session multiplexer: frame routing and shared write path for one
//! physical connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use futures_util::{SinkExt, StreamExt};
use hashbrown::HashMap;
use smux_codec::{CodecError, Frame, FrameReader, FrameWriter, SmuxCodec};
use smux_protocol::SmuxFlags;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use crate::connection::MuxSettings;
use crate::error::SessionError;
use crate::session::{Session, SessionInner};
use crate::transport::BoxedTransport;

/// State shared between session handles and the dispatch loop.
pub(crate) struct MuxCore {
    /// Single write path for all sessions. Frames are built under this lock
    /// so wire order always matches sequence-number order.
    writer: tokio::sync::Mutex<FrameWriter<WriteHalf<BoxedTransport>>>,
    sessions: parking_lot::Mutex<HashMap<u16, Arc<SessionInner>>>,
    next_session_id: AtomicU32,
    broken: AtomicBool,
    terminal: parking_lot::Mutex<Option<SessionError>>,
    settings: MuxSettings,
}

impl MuxCore {
    /// Acquire the shared write path, build a frame under it and transmit.
    ///
    /// `build` runs while the writer lock is held, so the sequence number it
    /// assigns cannot be reordered against other sessions' frames. It may
    /// decline to produce a frame (window closed), in which case nothing is
    /// written and `Ok(false)` is returned.
    pub(crate) async fn write_frame_with(
        &self,
        build: impl FnOnce() -> Result<Option<Frame>, SessionError>,
    ) -> Result<bool, SessionError> {
        let mut writer = self.writer.lock().await;
        let Some(frame) = build()? else {
            return Ok(false);
        };
        if let Err(error) = writer.send(frame).await {
            self.broken.store(true, Ordering::Release);
            let err = SessionError::Terminated(format!("frame write failed: {error}"));
            self.store_terminal(&err);
            return Err(err);
        }
        Ok(true)
    }

    pub(crate) fn remove_session(&self, id: u16) {
        self.sessions.lock().remove(&id);
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn store_terminal(&self, error: &SessionError) {
        let mut terminal = self.terminal.lock();
        if terminal.is_none() {
            *terminal = Some(error.clone());
        }
    }

    /// Mark the connection broken and broadcast `error` to every open
    /// session. Sessions are dropped from the routing table; later frames
    /// for them cannot arrive since the dispatch loop has stopped.
    pub(crate) fn fail_all(&self, error: SessionError) {
        self.broken.store(true, Ordering::Release);
        self.store_terminal(&error);
        let sessions: Vec<Arc<SessionInner>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.terminate(error.clone());
        }
    }
}

/// Runs MARS-style multiplexing on top of one physical transport.
///
/// Owns the transport's read half through a spawned dispatch task and shares
/// the write half among sessions. Dropping the multiplexer aborts the
/// dispatch task and terminates every open session.
pub struct SessionMultiplexer {
    core: Arc<MuxCore>,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionMultiplexer {
    /// Split the transport and start the inbound dispatch loop.
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn start(transport: BoxedTransport, settings: MuxSettings) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let codec = SmuxCodec::new().with_max_frame_size(settings.max_frame_size);
        let reader = FrameReader::with_codec(read_half, codec.clone());
        let writer = FrameWriter::with_codec(write_half, codec);

        let core = Arc::new(MuxCore {
            writer: tokio::sync::Mutex::new(writer),
            sessions: parking_lot::Mutex::new(HashMap::new()),
            next_session_id: AtomicU32::new(0),
            broken: AtomicBool::new(false),
            terminal: parking_lot::Mutex::new(None),
            settings,
        });
        let dispatch = tokio::spawn(run_dispatch(Arc::clone(&core), reader));
        Self {
            core,
            dispatch: parking_lot::Mutex::new(Some(dispatch)),
        }
    }

    /// Open a new logical session, sending its SYN.
    ///
    /// The session starts with sequence number 0 and both highwater marks at
    /// the configured initial window; the SYN advertises the receive window
    /// without consuming a sequence number.
    pub async fn open_session(&self) -> Result<Session, SessionError> {
        if self.core.is_broken() {
            let terminal = self.core.terminal.lock().clone();
            return Err(terminal
                .unwrap_or_else(|| SessionError::Terminated("connection is broken".into())));
        }

        let inner = {
            let mut sessions = self.core.sessions.lock();
            // u16 wraparound is tolerated; skip ids still in use.
            let id = loop {
                let candidate =
                    self.core.next_session_id.fetch_add(1, Ordering::Relaxed) as u16;
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            };
            let inner = Arc::new(SessionInner::new(
                id,
                self.core.settings.initial_window,
                self.core.settings.ack_threshold,
            ));
            // Registered before the SYN goes out so responses can route.
            sessions.insert(id, Arc::clone(&inner));
            inner
        };

        if let Err(error) = inner.send_control(&self.core, SmuxFlags::SYN).await {
            self.core.remove_session(inner.id);
            return Err(error);
        }
        inner.mark_open();
        tracing::debug!(session_id = inner.id, "session opened");
        Ok(Session {
            core: Arc::clone(&self.core),
            inner,
        })
    }

    /// Number of currently open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.core.sessions.lock().len()
    }

    /// Whether the underlying transport has failed.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.core.is_broken()
    }
}

impl Drop for SessionMultiplexer {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }
        self.core
            .fail_all(SessionError::Terminated("physical connection dropped".into()));
    }
}

impl std::fmt::Debug for SessionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMultiplexer")
            .field("sessions", &self.session_count())
            .field("broken", &self.is_broken())
            .finish()
    }
}

/// Inbound dispatch loop: routes each frame to its session by id.
///
/// Any protocol violation, decode failure or transport loss is fatal to the
/// whole physical connection and is broadcast to every open session.
async fn run_dispatch(core: Arc<MuxCore>, mut reader: FrameReader<ReadHalf<BoxedTransport>>) {
    loop {
        match reader.next().await {
            Some(Ok(frame)) => {
                let id = frame.header.session_id;
                let session = core.sessions.lock().get(&id).cloned();
                let Some(session) = session else {
                    core.fail_all(SessionError::Protocol(format!(
                        "frame for unknown session {id}"
                    )));
                    break;
                };
                match session.handle_frame(&core, frame).await {
                    Ok(false) => {}
                    Ok(true) => core.remove_session(id),
                    Err(error) => {
                        tracing::warn!(session_id = id, %error, "dispatch failed");
                        core.fail_all(error);
                        break;
                    }
                }
            }
            Some(Err(error)) => {
                let err = match error {
                    CodecError::InvalidHeader(source) => {
                        SessionError::Protocol(source.to_string())
                    }
                    CodecError::FrameTooLarge { .. } => {
                        SessionError::Protocol(error.to_string())
                    }
                    other => SessionError::Terminated(format!("frame read failed: {other}")),
                };
                core.fail_all(err);
                break;
            }
            None => {
                core.fail_all(SessionError::Terminated("transport closed by peer".into()));
                break;
            }
        }
    }
}
