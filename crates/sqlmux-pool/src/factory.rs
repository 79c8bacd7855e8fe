//! Connection factory: pool-group resolution, acquisition and the
//! background pruning sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{FactoryOptions, PoolConfig};
use crate::error::PoolError;
use crate::group::PoolGroup;
use crate::key::PoolKey;
use crate::opener::{ConnectionOpener, PhysicalConnector};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::throttle::NonPooledThrottle;

/// Attempts granted to an acquisition that keeps losing the pool-shutdown
/// race (group resolved, pool gone before the checkout). Never applied to
/// connection-level failures.
const SHUTDOWN_RACE_ATTEMPTS: u32 = 10;

/// Counters kept by the factory. Observability only; no decision logic
/// reads them.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub(crate) hard_connects: AtomicU64,
    pub(crate) non_pooled_connections: AtomicU64,
}

/// Snapshot of the factory's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryStats {
    /// Physical connections opened since the factory was created.
    pub hard_connects: u64,
    /// Non-pooled connections successfully delivered to a requester.
    pub non_pooled_connections: u64,
}

/// The driver-wide entry point for connection acquisition.
///
/// Maps each [`PoolKey`] to a [`PoolGroup`] through an immutable snapshot
/// map: readers clone the current `Arc` without blocking writers, and every
/// mutation publishes a freshly built map (copy-on-write). Disabled groups
/// are replaced, never revived.
pub struct ConnectionFactory {
    opener: Arc<dyn ConnectionOpener>,
    groups: RwLock<Arc<HashMap<PoolKey, Arc<PoolGroup>>>>,
    /// Shut-down pools waiting for their checked-out connections.
    pools_to_release: Mutex<Vec<Arc<ConnectionPool>>>,
    /// Disabled groups waiting for their pools to drain.
    groups_to_release: Mutex<Vec<Arc<PoolGroup>>>,
    throttle: NonPooledThrottle,
    stats: Arc<StatsInner>,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionFactory {
    /// Create a factory and, when inside a tokio runtime, start its
    /// background pruning sweep (first run after the due time, then every
    /// period).
    #[must_use]
    pub fn new(opener: Arc<dyn ConnectionOpener>, options: FactoryOptions) -> Arc<Self> {
        let factory = Arc::new(Self {
            opener,
            groups: RwLock::new(Arc::new(HashMap::new())),
            pools_to_release: Mutex::new(Vec::new()),
            groups_to_release: Mutex::new(Vec::new()),
            throttle: NonPooledThrottle::new(options.throttle_slots),
            stats: Arc::new(StatsInner::default()),
            pruner: Mutex::new(None),
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&factory);
            let due = options.pruning_due_time;
            let period = options.pruning_period;
            let task = handle.spawn(async move {
                tokio::time::sleep(due).await;
                loop {
                    let Some(factory) = weak.upgrade() else { break };
                    factory.prune_now();
                    drop(factory);
                    tokio::time::sleep(period).await;
                }
            });
            *factory.pruner.lock() = Some(task);
        }
        factory
    }

    /// Acquire a connection for `key`, waiting up to the configured acquire
    /// timeout when the pool is at capacity.
    ///
    /// With pooling disabled this opens a fresh connection synchronously.
    /// A pool that shuts down mid-acquisition is retried against a freshly
    /// resolved group, backing off from 1 ms and doubling per attempt;
    /// running out of attempts (or of waiting budget) is a
    /// [`PoolError::Timeout`]. Open failures propagate immediately.
    pub async fn acquire(
        &self,
        key: &PoolKey,
        config: &PoolConfig,
        owner: Option<u64>,
    ) -> Result<PooledConnection, PoolError> {
        config.validate()?;
        if !config.pooling_enabled {
            let connector = PhysicalConnector::new(
                Arc::clone(&self.opener),
                key.clone(),
                config.clone(),
                Arc::clone(&self.stats),
            );
            let conn = connector.connect().await?;
            conn.set_owner(owner);
            self.stats
                .non_pooled_connections
                .fetch_add(1, Ordering::Relaxed);
            return Ok(PooledConnection::non_pooled(conn));
        }

        let mut attempts_left = SHUTDOWN_RACE_ATTEMPTS;
        let mut delay = Duration::from_millis(1);
        loop {
            let group = self.resolve_group(key, config);
            if let Some(pool) = group.pool() {
                match pool.try_acquire(owner).await? {
                    Some(conn) => return Ok(conn),
                    None if pool.is_running() => return Err(PoolError::Timeout),
                    None => {}
                }
            }
            // Lost the shutdown race; back off and re-resolve the group.
            attempts_left -= 1;
            if attempts_left == 0 {
                return Err(PoolError::Timeout);
            }
            tracing::trace!(pool_key = %key, ?delay, "pool shut down mid-acquire, retrying");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    /// Open a non-pooled connection through the creation throttle,
    /// delivering the result through `completion`.
    ///
    /// Returns as soon as the creation is scheduled. Dropping the receiver
    /// cancels only the requester's wait: the creation keeps its throttle
    /// slot, and a connection completing after its requester gave up is
    /// destroyed.
    pub fn acquire_non_pooled(
        &self,
        key: &PoolKey,
        config: &PoolConfig,
        owner: Option<u64>,
        completion: oneshot::Sender<Result<PooledConnection, PoolError>>,
    ) -> Result<(), PoolError> {
        config.validate()?;
        let connector = PhysicalConnector::new(
            Arc::clone(&self.opener),
            key.clone(),
            config.clone(),
            Arc::clone(&self.stats),
        );
        let stats = Arc::clone(&self.stats);
        self.throttle.schedule(async move {
            match connector.connect().await {
                Ok(conn) => {
                    conn.set_owner(owner);
                    let id = conn.id();
                    match completion.send(Ok(PooledConnection::non_pooled(conn))) {
                        Ok(()) => {
                            // Counted only on successful delivery.
                            stats.non_pooled_connections.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            tracing::debug!(
                                connection_id = id,
                                "requester gone, destroying non-pooled connection"
                            );
                        }
                    }
                }
                Err(error) => {
                    let _ = completion.send(Err(error.into()));
                }
            }
        });
        Ok(())
    }

    /// Disable the group for `key` and queue its pool for release. The next
    /// acquisition for the same key builds a fresh group and pool.
    pub fn clear_pool(&self, key: &PoolKey) {
        let group = self.groups.read().get(key).cloned();
        if let Some(group) = group {
            if let Some(pool) = group.clear() {
                self.pools_to_release.lock().push(pool);
            }
            self.groups_to_release.lock().push(group);
        }
    }

    /// Disable every group and queue all pools for release.
    pub fn clear_all_pools(&self) {
        let snapshot = Arc::clone(&*self.groups.read());
        for group in snapshot.values() {
            if let Some(pool) = group.clear() {
                self.pools_to_release.lock().push(pool);
            }
            self.groups_to_release.lock().push(Arc::clone(group));
        }
    }

    /// Run one pruning sweep immediately.
    ///
    /// Normally driven by the background timer; exposed for shutdown paths
    /// and tests. Teardown runs outside the group-map lock, and individual
    /// teardown failures never halt the sweep.
    pub fn prune_now(&self) {
        let mut survivors: Vec<Arc<ConnectionPool>> = Vec::new();

        // Queued pools: gone once every checked-out connection came back.
        let queued = std::mem::take(&mut *self.pools_to_release.lock());
        for pool in queued {
            pool.shutdown();
            if !pool.is_empty() {
                survivors.push(pool);
            }
        }

        // Queued groups: prune until they own no pool, then drop them.
        let queued = std::mem::take(&mut *self.groups_to_release.lock());
        let mut group_survivors = Vec::new();
        for group in queued {
            let mut emptied = Vec::new();
            let ready = group.prune(&mut emptied);
            survivors.extend(emptied.into_iter().filter(|p| !p.is_empty()));
            if !ready {
                group_survivors.push(group);
            }
        }
        self.groups_to_release.lock().extend(group_survivors);

        // Live map: prune every group; fully idle ones are swapped out.
        let mut emptied = Vec::new();
        let mut doomed: Vec<Arc<PoolGroup>> = Vec::new();
        let snapshot = Arc::clone(&*self.groups.read());
        for group in snapshot.values() {
            if group.prune(&mut emptied) {
                doomed.push(Arc::clone(group));
            }
        }
        survivors.extend(emptied.into_iter().filter(|p| !p.is_empty()));

        if !doomed.is_empty() {
            let mut guard = self.groups.write();
            // Rebuild from the published map, which may have moved on since
            // the snapshot; match doomed groups by identity.
            let mut rebuilt = HashMap::with_capacity(guard.len());
            for (key, group) in guard.iter() {
                if !doomed.iter().any(|d| Arc::ptr_eq(d, group)) {
                    rebuilt.insert(key.clone(), Arc::clone(group));
                }
            }
            *guard = Arc::new(rebuilt);
            drop(guard);
            self.groups_to_release.lock().extend(doomed);
        }

        if !survivors.is_empty() {
            tracing::debug!(pending = survivors.len(), "pools still draining after sweep");
        }
        self.pools_to_release.lock().extend(survivors);
    }

    /// Snapshot of the factory's counters.
    #[must_use]
    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            hard_connects: self.stats.hard_connects.load(Ordering::Relaxed),
            non_pooled_connections: self.stats.non_pooled_connections.load(Ordering::Relaxed),
        }
    }

    /// Number of live (not yet released) pool groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Resolve the group for `key`, building and publishing a new one when
    /// the key is unknown or its group was disabled. The configuration of
    /// the first resolver wins for the lifetime of the group.
    fn resolve_group(&self, key: &PoolKey, config: &PoolConfig) -> Arc<PoolGroup> {
        {
            let snapshot = self.groups.read();
            if let Some(group) = snapshot.get(key) {
                if !group.is_disabled() {
                    return Arc::clone(group);
                }
            }
        }

        let mut guard = self.groups.write();
        // Another task may have published the group while we waited.
        if let Some(group) = guard.get(key) {
            if !group.is_disabled() {
                return Arc::clone(group);
            }
            // The disabled group is replaced, never revived.
            self.groups_to_release.lock().push(Arc::clone(group));
        }

        let connector = Arc::new(PhysicalConnector::new(
            Arc::clone(&self.opener),
            key.clone(),
            config.clone(),
            Arc::clone(&self.stats),
        ));
        let group = Arc::new(PoolGroup::new(key.clone(), config.clone(), connector));

        // Copy-on-write: the published map is never mutated in place.
        let mut rebuilt = HashMap::with_capacity(guard.len() + 1);
        for (existing_key, existing) in guard.iter() {
            if existing_key != key {
                rebuilt.insert(existing_key.clone(), Arc::clone(existing));
            }
        }
        rebuilt.insert(key.clone(), Arc::clone(&group));
        *guard = Arc::new(rebuilt);
        tracing::debug!(pool_key = %key, "created pool group");
        group
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        if let Some(task) = self.pruner.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("groups", &self.group_count())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
