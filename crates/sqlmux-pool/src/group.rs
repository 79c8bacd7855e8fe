//! Pool groups: one per distinct pool identity.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::key::PoolKey;
use crate::opener::PhysicalConnector;
use crate::pool::ConnectionPool;

/// Activity walked by the pruning sweep. A group with no pool steps one
/// state per sweep; any use snaps it back to `Active`. `Disabled` is final:
/// the factory replaces the group instead of reviving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupActivity {
    Active,
    Idle,
    Disabled,
}

struct GroupState {
    pool: Option<Arc<ConnectionPool>>,
    activity: GroupActivity,
}

/// All pooling state for one [`PoolKey`]: the resolved configuration plus
/// at most one live [`ConnectionPool`], created lazily.
pub struct PoolGroup {
    key: PoolKey,
    config: PoolConfig,
    connector: Arc<PhysicalConnector>,
    state: Mutex<GroupState>,
}

impl PoolGroup {
    pub(crate) fn new(key: PoolKey, config: PoolConfig, connector: Arc<PhysicalConnector>) -> Self {
        Self {
            key,
            config,
            connector,
            state: Mutex::new(GroupState {
                pool: None,
                activity: GroupActivity::Active,
            }),
        }
    }

    /// The group's identity.
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The resolved pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The group's pool, created lazily on first use.
    ///
    /// Returns `None` when pooling is disabled in the configuration or the
    /// group has been disabled (the caller must re-resolve a fresh group).
    /// A pool that is no longer running is replaced by a new one; the old
    /// pool finishes draining through the guards still holding it.
    #[must_use]
    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        if !self.config.pooling_enabled {
            return None;
        }
        let mut state = self.state.lock();
        if state.activity == GroupActivity::Disabled {
            return None;
        }
        state.activity = GroupActivity::Active;
        match &state.pool {
            Some(pool) if pool.is_running() => Some(Arc::clone(pool)),
            _ => {
                let pool = Arc::new(ConnectionPool::new(
                    self.key.clone(),
                    self.config.clone(),
                    Arc::clone(&self.connector),
                ));
                tracing::debug!(pool_key = %self.key, "created connection pool");
                state.pool = Some(Arc::clone(&pool));
                Some(pool)
            }
        }
    }

    /// Disable the group and take its pool out for shutdown.
    ///
    /// The returned pool (if any) has been shut down; the caller queues it
    /// until its checked-out connections come back.
    pub(crate) fn clear(&self) -> Option<Arc<ConnectionPool>> {
        let pool = {
            let mut state = self.state.lock();
            state.activity = GroupActivity::Disabled;
            state.pool.take()
        };
        if let Some(pool) = &pool {
            tracing::debug!(pool_key = %self.key, "clearing pool group");
            pool.shutdown();
        }
        pool
    }

    /// One pruning step. Empty pools are shut down and pushed onto
    /// `released_pools`; a group left without a pool walks
    /// `Active -> Idle -> Disabled` across successive sweeps.
    ///
    /// Returns whether the group is disabled and ready for release.
    pub(crate) fn prune(&self, released_pools: &mut Vec<Arc<ConnectionPool>>) -> bool {
        let mut state = self.state.lock();
        if let Some(pool) = &state.pool {
            if pool.prune_idle() {
                let pool = Arc::clone(pool);
                pool.shutdown();
                state.pool = None;
                released_pools.push(pool);
            }
        }
        if state.pool.is_some() {
            return false;
        }
        match state.activity {
            GroupActivity::Active => {
                state.activity = GroupActivity::Idle;
                false
            }
            GroupActivity::Idle => {
                tracing::debug!(pool_key = %self.key, "disabling inactive pool group");
                state.activity = GroupActivity::Disabled;
                true
            }
            GroupActivity::Disabled => true,
        }
    }

    /// Whether the group has been disabled and must be re-resolved.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.state.lock().activity == GroupActivity::Disabled
    }
}

impl std::fmt::Debug for PoolGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PoolGroup")
            .field("key", &self.key)
            .field("activity", &state.activity)
            .field("has_pool", &state.pool.is_some())
            .finish()
    }
}
