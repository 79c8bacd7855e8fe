//! Transport establishment seam.
//!
//! The pooling engine is agnostic to how connections are dialed, secured
//! and authenticated; all of that lives behind [`ConnectionOpener`]. The
//! pool only sees the finished, opaque transport.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use sqlmux_session::{BoxedTransport, PhysicalConnection, TransportError};

use crate::config::PoolConfig;
use crate::factory::StatsInner;
use crate::key::PoolKey;

/// Opens transport-level connections for a pool.
///
/// `#[async_trait]` for object safety: the factory and every pool share one
/// opener through dynamic dispatch.
#[async_trait::async_trait]
pub trait ConnectionOpener: Send + Sync {
    /// Establish a transport for the given pool identity.
    ///
    /// Called outside all pool locks; may take arbitrarily long. An error
    /// is surfaced to the acquiring caller as [`PoolError::Creation`] and
    /// is never retried by the pool.
    ///
    /// [`PoolError::Creation`]: crate::error::PoolError::Creation
    async fn open(&self, key: &PoolKey) -> Result<BoxedTransport, TransportError>;
}

/// Bundles everything needed to produce a ready [`PhysicalConnection`]:
/// the opener, the pool identity it dials for and the pool configuration
/// deciding direct versus multiplexed mode.
pub(crate) struct PhysicalConnector {
    opener: Arc<dyn ConnectionOpener>,
    key: PoolKey,
    config: PoolConfig,
    stats: Arc<StatsInner>,
}

impl PhysicalConnector {
    pub(crate) fn new(
        opener: Arc<dyn ConnectionOpener>,
        key: PoolKey,
        config: PoolConfig,
        stats: Arc<StatsInner>,
    ) -> Self {
        Self {
            opener,
            key,
            config,
            stats,
        }
    }

    /// Open one physical connection, counting it as a hard connect.
    pub(crate) async fn connect(&self) -> Result<PhysicalConnection, TransportError> {
        let transport = self.opener.open(&self.key).await?;
        let conn = if self.config.multiplexing_enabled {
            PhysicalConnection::multiplexed(transport, self.config.mux_settings)
        } else {
            PhysicalConnection::direct(transport)
        };
        self.stats.hard_connects.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            connection_id = conn.id(),
            pool_key = %self.key,
            multiplexed = conn.is_multiplexed(),
            "opened physical connection"
        );
        Ok(conn)
    }
}

impl std::fmt::Debug for PhysicalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnector")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
