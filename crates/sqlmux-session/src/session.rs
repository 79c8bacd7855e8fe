//! Multiplexed session: one logical stream over a shared physical connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use smux_codec::Frame;
use smux_protocol::{SmuxFlags, SmuxHeader};
use tokio::sync::watch;

use crate::error::SessionError;
use crate::multiplexer::MuxCore;

/// Outcome of a queued (non-blocking) send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The payload was framed and handed to the transport immediately.
    Sent,
    /// The flow-control window is closed; the payload was queued and will be
    /// drained as ACKs open the window.
    Pending,
}

/// Lifecycle of a multiplexed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// SYN is being sent.
    Opening,
    /// Usable for send/receive.
    Open,
    /// FIN sent, awaiting teardown.
    Closing,
    /// Fully closed (locally or by peer FIN).
    Closed,
}

/// Mutable per-session state. All counters and queues live behind one lock;
/// sessions on the same physical connection never contend with each other.
struct Shared {
    state: SessionState,
    /// Next DATA sequence number. Incremented only for DATA frames.
    sequence_number: u32,
    /// Peer-advertised credit: DATA may be sent while `sequence_number` is
    /// below this mark.
    send_highwater: u32,
    /// Local receive credit, incremented once per delivered DATA frame.
    receive_highwater: u32,
    /// Highwater value last advertised to the peer (on any outgoing frame).
    receive_highwater_last_ack: u32,
    /// Expected sequence number of the next inbound DATA frame.
    next_inbound_seq: u32,
    inbound: VecDeque<Bytes>,
    outbound: VecDeque<Bytes>,
    terminal: Option<SessionError>,
    fin_sent: bool,
}

impl Shared {
    fn check_usable(&self) -> Result<(), SessionError> {
        if let Some(err) = &self.terminal {
            return Err(err.clone());
        }
        match self.state {
            SessionState::Closing | SessionState::Closed => Err(SessionError::Closed),
            SessionState::Opening | SessionState::Open => Ok(()),
        }
    }
}

/// Session internals shared between the public handle and the dispatch loop.
pub(crate) struct SessionInner {
    pub(crate) id: u16,
    ack_threshold: u32,
    shared: Mutex<Shared>,
    /// Woken when the send window may have opened (ACK or terminal error).
    wake_send: watch::Sender<()>,
    /// Woken when inbound data arrived or the session ended.
    wake_recv: watch::Sender<()>,
}

impl SessionInner {
    pub(crate) fn new(id: u16, initial_window: u32, ack_threshold: u32) -> Self {
        let (wake_send, _) = watch::channel(());
        let (wake_recv, _) = watch::channel(());
        Self {
            id,
            ack_threshold,
            shared: Mutex::new(Shared {
                state: SessionState::Opening,
                sequence_number: 0,
                send_highwater: initial_window,
                receive_highwater: initial_window,
                receive_highwater_last_ack: initial_window,
                next_inbound_seq: 0,
                inbound: VecDeque::new(),
                outbound: VecDeque::new(),
                terminal: None,
                fin_sent: false,
            }),
            wake_send,
            wake_recv,
        }
    }

    pub(crate) fn mark_open(&self) {
        let mut shared = self.shared.lock();
        if shared.state == SessionState::Opening {
            shared.state = SessionState::Open;
        }
    }

    /// Send a payload-less control frame (SYN, ACK or FIN).
    ///
    /// Control frames never consume a sequence number: SYN carries the
    /// current one, ACK and FIN the previous. Every outgoing frame also
    /// advertises the current receive highwater, which counts as an ack.
    pub(crate) async fn send_control(
        &self,
        core: &MuxCore,
        flags: SmuxFlags,
    ) -> Result<(), SessionError> {
        core.write_frame_with(|| {
            let mut shared = self.shared.lock();
            let seq = if flags == SmuxFlags::SYN {
                shared.sequence_number
            } else {
                shared.sequence_number.saturating_sub(1)
            };
            let header = SmuxHeader::control(flags, self.id, seq, shared.receive_highwater);
            shared.receive_highwater_last_ack = shared.receive_highwater;
            Ok(Some(Frame::control(header)))
        })
        .await
        .map(|_| ())
    }

    /// Store a terminal error and wake every waiter on this session.
    pub(crate) fn terminate(&self, error: SessionError) {
        {
            let mut shared = self.shared.lock();
            if shared.terminal.is_none() {
                shared.terminal = Some(error);
            }
        }
        let _ = self.wake_send.send(());
        let _ = self.wake_recv.send(());
    }

    /// Apply a peer-advertised send highwater, draining queued sends if the
    /// window opened. No-op when the mark is unchanged.
    pub(crate) async fn handle_ack(
        &self,
        core: &MuxCore,
        highwater: u32,
    ) -> Result<(), SessionError> {
        {
            let mut shared = self.shared.lock();
            if shared.send_highwater == highwater {
                return Ok(());
            }
            shared.send_highwater = highwater;
        }
        self.drain_outbound(core).await
    }

    /// Dequeue and send pending payloads while the window is open, then wake
    /// any blocked senders so they re-check the window.
    async fn drain_outbound(&self, core: &MuxCore) -> Result<(), SessionError> {
        loop {
            let sent = core
                .write_frame_with(|| {
                    let mut shared = self.shared.lock();
                    if shared.terminal.is_some() {
                        return Ok(None);
                    }
                    if shared.sequence_number >= shared.send_highwater {
                        return Ok(None);
                    }
                    let Some(payload) = shared.outbound.pop_front() else {
                        return Ok(None);
                    };
                    let header = SmuxHeader::data(
                        self.id,
                        shared.sequence_number,
                        shared.receive_highwater,
                        payload.len(),
                    );
                    shared.sequence_number += 1;
                    shared.receive_highwater_last_ack = shared.receive_highwater;
                    Ok(Some(Frame::new(header, payload)))
                })
                .await?;
            if !sent {
                break;
            }
        }
        let _ = self.wake_send.send(());
        Ok(())
    }

    /// Handle one inbound frame routed to this session by the dispatch loop.
    ///
    /// Returns `Ok(true)` when the peer closed the session with FIN.
    pub(crate) async fn handle_frame(
        &self,
        core: &MuxCore,
        frame: Frame,
    ) -> Result<bool, SessionError> {
        let header = frame.header;

        // Every frame carries the peer's receive highwater; a change is how
        // the peer grants flow-control credit.
        self.handle_ack(core, header.highwater).await?;

        if header.flags.contains(SmuxFlags::DATA) {
            {
                let mut shared = self.shared.lock();
                if header.sequence_number != shared.next_inbound_seq {
                    return Err(SessionError::Protocol(format!(
                        "session {}: expected inbound sequence {}, got {}",
                        self.id, shared.next_inbound_seq, header.sequence_number
                    )));
                }
                shared.next_inbound_seq += 1;
                shared.inbound.push_back(frame.payload);
            }
            let _ = self.wake_recv.send(());
            Ok(false)
        } else if header.flags.contains(SmuxFlags::FIN) {
            tracing::debug!(session_id = self.id, "peer closed session");
            {
                let mut shared = self.shared.lock();
                shared.state = SessionState::Closed;
            }
            let _ = self.wake_recv.send(());
            let _ = self.wake_send.send(());
            Ok(true)
        } else if header.flags.contains(SmuxFlags::ACK) {
            // Credit already applied above.
            Ok(false)
        } else {
            Err(SessionError::Protocol(format!(
                "session {}: unexpected {:?} frame",
                self.id, header.flags
            )))
        }
    }
}

/// One logical stream multiplexed over a physical connection.
///
/// Obtained from [`PhysicalConnection::open_session`]. Dropping the session
/// sends a best-effort FIN if [`Session::close`] was not called first.
///
/// [`PhysicalConnection::open_session`]: crate::connection::PhysicalConnection::open_session
pub struct Session {
    pub(crate) core: Arc<MuxCore>,
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Session id, unique within the physical connection.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Whether the session has been closed (locally or by the peer).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self.inner.shared.lock().state,
            SessionState::Closing | SessionState::Closed
        )
    }

    /// Send a payload, waiting for flow-control credit if the window is
    /// closed.
    ///
    /// Frames the payload as DATA with the next sequence number. A DATA frame
    /// is never emitted with a sequence number at or above the last
    /// peer-advertised highwater; the call waits until an ACK raises it.
    /// Payloads already queued by [`Session::queue_send`] keep their place:
    /// this call waits behind a non-empty queue rather than overtaking it. An
    /// enclosing operation timeout may cancel the wait without disturbing
    /// session state.
    pub async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        let mut window = self.inner.wake_send.subscribe();
        loop {
            let sent = self
                .core
                .write_frame_with(|| {
                    let mut shared = self.inner.shared.lock();
                    shared.check_usable()?;
                    if !shared.outbound.is_empty()
                        || shared.sequence_number >= shared.send_highwater
                    {
                        return Ok(None);
                    }
                    let header = SmuxHeader::data(
                        self.inner.id,
                        shared.sequence_number,
                        shared.receive_highwater,
                        payload.len(),
                    );
                    shared.sequence_number += 1;
                    shared.receive_highwater_last_ack = shared.receive_highwater;
                    Ok(Some(Frame::new(header, payload.clone())))
                })
                .await?;
            if sent {
                return Ok(());
            }
            if window.changed().await.is_err() {
                return Err(SessionError::Closed);
            }
        }
    }

    /// Send a payload without waiting for flow-control credit.
    ///
    /// If the window is closed (or earlier payloads are already queued), the
    /// payload is enqueued and [`SendStatus::Pending`] is returned; a drain
    /// routine sends queued payloads in order as ACKs open the window.
    pub async fn queue_send(&self, payload: Bytes) -> Result<SendStatus, SessionError> {
        let sent = self
            .core
            .write_frame_with(|| {
                let mut shared = self.inner.shared.lock();
                shared.check_usable()?;
                if shared.outbound.is_empty() && shared.sequence_number < shared.send_highwater {
                    let header = SmuxHeader::data(
                        self.inner.id,
                        shared.sequence_number,
                        shared.receive_highwater,
                        payload.len(),
                    );
                    shared.sequence_number += 1;
                    shared.receive_highwater_last_ack = shared.receive_highwater;
                    Ok(Some(Frame::new(header, payload.clone())))
                } else {
                    shared.outbound.push_back(payload.clone());
                    Ok(None)
                }
            })
            .await?;
        Ok(if sent {
            SendStatus::Sent
        } else {
            SendStatus::Pending
        })
    }

    /// Receive the next payload, waiting up to `timeout` (or indefinitely
    /// when `None`) if nothing is queued.
    ///
    /// Each delivered DATA frame raises the local receive highwater by one;
    /// once the un-acknowledged count exceeds the ACK threshold, a dedicated
    /// ACK control frame is emitted. A stored terminal error is returned
    /// instead of waiting.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Bytes, SessionError> {
        let mut arrived = self.inner.wake_recv.subscribe();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if let Some(payload) = self.take_inbound()? {
                return Ok(payload);
            }
            let changed = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, arrived.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => return Err(SessionError::Timeout),
                    }
                }
                None => arrived.changed().await,
            };
            if changed.is_err() {
                return Err(SessionError::Closed);
            }
        }
    }

    /// Receive the next payload if one is queued, without waiting.
    pub async fn try_recv(&self) -> Result<Option<Bytes>, SessionError> {
        self.take_inbound()
    }

    /// Close the session, sending a best-effort FIN.
    ///
    /// Exactly one FIN is sent per session; a transmission failure is
    /// reported to the log and not retried. The session stays routable until
    /// the peer answers with its own FIN, so tail frames already in flight
    /// for this id are absorbed instead of poisoning the connection.
    pub async fn close(&self) {
        if !self.begin_close() {
            return;
        }
        if let Err(error) = self.inner.send_control(&self.core, SmuxFlags::FIN).await {
            tracing::warn!(session_id = self.inner.id, %error, "FIN transmission failed");
        }
        self.inner.shared.lock().state = SessionState::Closed;
        // Concurrent waiters re-check state and observe the close.
        let _ = self.inner.wake_send.send(());
        let _ = self.inner.wake_recv.send(());
    }

    /// Dequeue one inbound payload, bump the receive highwater and emit an
    /// ACK if the threshold was crossed. Shared by `recv` and `try_recv`.
    fn take_inbound(&self) -> Result<Option<Bytes>, SessionError> {
        let (payload, ack_due) = {
            let mut shared = self.inner.shared.lock();
            if let Some(err) = &shared.terminal {
                return Err(err.clone());
            }
            match shared.inbound.pop_front() {
                Some(payload) => {
                    shared.receive_highwater += 1;
                    let gap = shared
                        .receive_highwater
                        .saturating_sub(shared.receive_highwater_last_ack);
                    let ack_due = gap > self.inner.ack_threshold;
                    if ack_due {
                        // Latched here, not when the ACK task runs, so
                        // back-to-back dequeues cannot trip the threshold
                        // again while the ACK is still in flight.
                        shared.receive_highwater_last_ack = shared.receive_highwater;
                    }
                    (Some(payload), ack_due)
                }
                None => {
                    if shared.state == SessionState::Closed {
                        return Err(SessionError::Closed);
                    }
                    (None, false)
                }
            }
        };
        if ack_due {
            self.spawn_ack();
        }
        Ok(payload)
    }

    /// Emit an ACK control frame off the caller's path. An ACK that fails to
    /// transmit is logged; the dispatch loop will surface the broken
    /// transport soon after.
    fn spawn_ack(&self) {
        let core = Arc::clone(&self.core);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(error) = inner.send_control(&core, SmuxFlags::ACK).await {
                tracing::warn!(session_id = inner.id, %error, "ACK transmission failed");
            }
        });
    }

    /// Transition into `Closing` if a FIN is still owed. Returns whether the
    /// caller should send it.
    fn begin_close(&self) -> bool {
        let mut shared = self.inner.shared.lock();
        if shared.fin_sent
            || shared.terminal.is_some()
            || shared.state == SessionState::Closed
        {
            return false;
        }
        shared.fin_sent = true;
        shared.state = SessionState::Closing;
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The routing-table entry survives until the peer's FIN comes back;
        // the dispatch loop retires it then.
        let owed_fin = self.begin_close();
        if !owed_fin {
            return;
        }
        // Best-effort FIN without an async context of our own.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let core = Arc::clone(&self.core);
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move {
                if let Err(error) = inner.send_control(&core, SmuxFlags::FIN).await {
                    tracing::warn!(session_id = inner.id, %error, "FIN transmission failed");
                }
                let mut shared = inner.shared.lock();
                if shared.state == SessionState::Closing {
                    shared.state = SessionState::Closed;
                }
            });
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &shared.state)
            .field("sequence_number", &shared.sequence_number)
            .field("send_highwater", &shared.send_highwater)
            .field("receive_highwater", &shared.receive_highwater)
            .finish_non_exhaustive()
    }
}
