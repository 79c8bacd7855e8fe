//! Connection pool implementation.

use std::sync::Arc;

use parking_lot::Mutex;
use sqlmux_session::PhysicalConnection;
use tokio::sync::Notify;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::key::PoolKey;
use crate::opener::PhysicalConnector;

/// Lifecycle of a connection pool. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting acquisitions.
    Running,
    /// Shut down, waiting for checked-out connections to come back.
    ShuttingDown,
    /// Every connection destroyed.
    Shutdown,
}

struct PoolShared {
    state: PoolState,
    /// Idle connections, owned by value: a connection is either here, or
    /// inside exactly one checked-out guard, never both.
    idle: Vec<PhysicalConnection>,
    /// Idle + checked out + reserved in-flight creations.
    total: u32,
}

/// A pool of physical connections for one [`PoolKey`].
///
/// Acquisition prefers an idle connection, then creates one if under
/// `max_size`, and otherwise waits for a release. The live-connection count
/// never exceeds `max_size`: a slot is reserved before a creation starts
/// and freed if it fails.
pub struct ConnectionPool {
    key: PoolKey,
    config: PoolConfig,
    connector: Arc<PhysicalConnector>,
    shared: Mutex<PoolShared>,
    /// Wakes one waiter per release (or freed creation slot).
    released: Notify,
}

enum Plan {
    Reuse(PhysicalConnection),
    Create,
    Wait,
}

impl ConnectionPool {
    pub(crate) fn new(key: PoolKey, config: PoolConfig, connector: Arc<PhysicalConnector>) -> Self {
        Self {
            key,
            config,
            connector,
            shared: Mutex::new(PoolShared {
                state: PoolState::Running,
                idle: Vec::new(),
                total: 0,
            }),
            released: Notify::new(),
        }
    }

    /// Try to acquire a connection within the configured acquire timeout.
    ///
    /// Returns `Ok(None)` in two cases the caller must tell apart via
    /// [`is_running`](Self::is_running): the pool is shutting down (the
    /// caller should re-resolve its group and retry), or the wait timed out
    /// while the pool stayed at capacity (an acquisition timeout).
    ///
    /// Creation failures are not retried; the transport error propagates
    /// immediately with the reserved slot freed.
    pub async fn try_acquire(
        self: &Arc<Self>,
        owner: Option<u64>,
    ) -> Result<Option<PooledConnection>, PoolError> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        loop {
            let plan = self.plan_acquire();
            match plan {
                None => return Ok(None),
                Some(Plan::Reuse(conn)) => {
                    tracing::trace!(
                        connection_id = conn.id(),
                        pool_key = %self.key,
                        "reusing idle connection"
                    );
                    return Ok(Some(self.checkout(conn, owner)));
                }
                Some(Plan::Create) => match self.connector.connect().await {
                    Ok(conn) => return Ok(Some(self.checkout(conn, owner))),
                    Err(error) => {
                        self.shared.lock().total -= 1;
                        self.released.notify_one();
                        return Err(error.into());
                    }
                },
                Some(Plan::Wait) => {
                    let notified = self.released.notified();
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Decide how to satisfy one acquisition attempt. `None` means the pool
    /// is no longer running. Broken idle connections found on the way are
    /// discarded and their slots freed.
    fn plan_acquire(&self) -> Option<Plan> {
        let mut discarded = Vec::new();
        let plan = {
            let mut shared = self.shared.lock();
            if shared.state != PoolState::Running {
                return None;
            }
            loop {
                match shared.idle.pop() {
                    Some(conn) if conn.is_broken() => {
                        shared.total -= 1;
                        discarded.push(conn);
                    }
                    Some(conn) => break Plan::Reuse(conn),
                    None => {
                        if shared.total < self.config.max_size {
                            // Reserve the slot before the slow open.
                            shared.total += 1;
                            break Plan::Create;
                        }
                        break Plan::Wait;
                    }
                }
            }
        };
        for conn in discarded {
            tracing::debug!(connection_id = conn.id(), "discarding broken idle connection");
            drop(conn);
            self.released.notify_one();
        }
        Some(plan)
    }

    fn checkout(self: &Arc<Self>, conn: PhysicalConnection, owner: Option<u64>) -> PooledConnection {
        conn.set_owner(owner);
        tracing::trace!(connection_id = conn.id(), pool_key = %self.key, "checked out");
        PooledConnection {
            conn: Some(conn),
            pool: Some(Arc::clone(self)),
        }
    }

    /// Return a connection to the pool.
    ///
    /// Broken connections, and any connection returned to a pool that is no
    /// longer running, are destroyed and their slot freed; otherwise the
    /// connection re-enters the idle set and one waiter is woken.
    pub(crate) fn release(&self, conn: PhysicalConnection) {
        conn.set_owner(None);
        let destroyed = {
            let mut shared = self.shared.lock();
            if conn.is_broken() || shared.state != PoolState::Running {
                shared.total = shared.total.saturating_sub(1);
                Self::maybe_finish_shutdown(&mut shared);
                Some(conn)
            } else {
                tracing::trace!(connection_id = conn.id(), pool_key = %self.key, "checked in");
                shared.idle.push(conn);
                None
            }
        };
        if let Some(conn) = destroyed {
            tracing::debug!(connection_id = conn.id(), "destroying returned connection");
            drop(conn);
        }
        self.released.notify_one();
    }

    /// Remove a checked-out connection from the pool's accounting without
    /// destroying it (the guard was detached).
    pub(crate) fn forget(&self) {
        let mut shared = self.shared.lock();
        shared.total = shared.total.saturating_sub(1);
        Self::maybe_finish_shutdown(&mut shared);
        drop(shared);
        self.released.notify_one();
    }

    /// Shut the pool down: destroy idle connections and wake all waiters.
    /// Checked-out connections are destroyed as they come back.
    pub fn shutdown(&self) {
        let drained = {
            let mut shared = self.shared.lock();
            if shared.state == PoolState::Shutdown {
                return;
            }
            shared.state = PoolState::ShuttingDown;
            let drained = std::mem::take(&mut shared.idle);
            shared.total = shared.total.saturating_sub(drained.len() as u32);
            Self::maybe_finish_shutdown(&mut shared);
            drained
        };
        tracing::debug!(pool_key = %self.key, destroyed = drained.len(), "pool shutting down");
        drop(drained);
        self.released.notify_waiters();
    }

    /// Destroy idle connections beyond `min_size` (oldest first) along with
    /// any broken ones. Returns whether the pool is now empty.
    pub(crate) fn prune_idle(&self) -> bool {
        let pruned = {
            let mut shared = self.shared.lock();
            let before = shared.idle.len();
            let mut keep = Vec::new();
            let mut pruned = Vec::new();
            for conn in shared.idle.drain(..) {
                if conn.is_broken() {
                    pruned.push(conn);
                } else {
                    keep.push(conn);
                }
            }
            // Oldest surplus connections go first.
            let surplus = keep.len().saturating_sub(self.config.min_size as usize);
            pruned.extend(keep.drain(..surplus));
            shared.idle = keep;
            let removed = (before - shared.idle.len()) as u32;
            shared.total = shared.total.saturating_sub(removed);
            Self::maybe_finish_shutdown(&mut shared);
            pruned
        };
        if !pruned.is_empty() {
            tracing::debug!(pool_key = %self.key, pruned = pruned.len(), "pruned idle connections");
        }
        drop(pruned);
        self.is_empty()
    }

    fn maybe_finish_shutdown(shared: &mut PoolShared) {
        if shared.state == PoolState::ShuttingDown && shared.total == 0 {
            shared.state = PoolState::Shutdown;
        }
    }

    /// Whether the pool still accepts acquisitions.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.lock().state == PoolState::Running
    }

    /// Whether the pool owns no connections at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.lock().total == 0
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.shared.lock().state
    }

    /// Number of idle connections.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.shared.lock().idle.len()
    }

    /// Number of live connections (idle + checked out + in-flight creations).
    #[must_use]
    pub fn total_count(&self) -> u32 {
        self.shared.lock().total
    }

    /// The pool's identity.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("state", &shared.state)
            .field("idle", &shared.idle.len())
            .field("total", &shared.total)
            .finish()
    }
}

/// A connection checked out of a pool (or opened non-pooled).
///
/// Dereferences to the underlying [`PhysicalConnection`]. On drop, a pooled
/// connection returns to its pool; a non-pooled one is simply destroyed.
pub struct PooledConnection {
    conn: Option<PhysicalConnection>,
    pool: Option<Arc<ConnectionPool>>,
}

impl PooledConnection {
    /// Wrap a connection that bypassed pooling.
    pub(crate) fn non_pooled(conn: PhysicalConnection) -> Self {
        Self {
            conn: Some(conn),
            pool: None,
        }
    }

    /// Detach the connection from its pool.
    ///
    /// The pool stops accounting for it and the caller takes over its
    /// lifetime; it will not be returned on drop.
    #[must_use]
    pub fn detach(mut self) -> PhysicalConnection {
        if let Some(pool) = self.pool.take() {
            pool.forget();
        }
        match self.conn.take() {
            Some(conn) => conn,
            None => unreachable!("connection is present until drop or detach"),
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = PhysicalConnection;

    fn deref(&self) -> &PhysicalConnection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is present until drop or detach"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // take() makes a double release structurally impossible.
        if let Some(conn) = self.conn.take() {
            match &self.pool {
                Some(pool) => pool.release(conn),
                None => drop(conn),
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
