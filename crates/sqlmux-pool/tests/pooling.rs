//! Integration tests for the pooling engine against a mock opener.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use sqlmux_pool::{ConnectionFactory, ConnectionOpener, FactoryOptions, PoolConfig, PoolError, PoolKey};
use sqlmux_session::{BoxedTransport, TransportError};
use tokio::sync::oneshot;

/// Opener over in-memory transports, instrumented for the assertions.
/// The far duplex halves are kept alive so a multiplexed connection's
/// dispatch loop does not see an immediate EOF.
struct MockOpener {
    delay: Duration,
    fail: AtomicBool,
    opened: AtomicUsize,
    concurrent: AtomicUsize,
    peak: AtomicUsize,
    remotes: parking_lot::Mutex<Vec<tokio::io::DuplexStream>>,
}

impl MockOpener {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            remotes: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConnectionOpener for MockOpener {
    async fn open(&self, _key: &PoolKey) -> Result<BoxedTransport, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("open refused".into()));
        }
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(1024);
        self.remotes.lock().push(remote);
        Ok(Box::new(local))
    }
}

fn quiet_factory(opener: Arc<MockOpener>) -> Arc<ConnectionFactory> {
    // Long due time keeps the background sweep out of the way; tests drive
    // pruning explicitly through prune_now.
    ConnectionFactory::new(
        opener,
        FactoryOptions::new().pruning_due_time(Duration::from_secs(3600)),
    )
}

fn key() -> PoolKey {
    PoolKey::new("server=db1;database=app")
}

#[tokio::test]
async fn test_idle_connection_is_reused() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(2);

    let first = factory.acquire(&key(), &config, Some(1)).await.unwrap();
    let first_id = first.id();
    drop(first);

    let second = factory.acquire(&key(), &config, Some(2)).await.unwrap();
    assert_eq!(second.id(), first_id);
    assert_eq!(opener.opened(), 1);
}

#[tokio::test]
async fn test_capacity_respected_under_concurrency() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(4);

    let mut tasks = Vec::new();
    for n in 0..16u64 {
        let factory = Arc::clone(&factory);
        let config = config.clone();
        tasks.push(tokio::spawn(async move {
            let conn = factory.acquire(&key(), &config, Some(n)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(conn);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Reuse keeps the number of physical opens at or below the cap.
    assert!(opener.opened() <= 4, "opened {}", opener.opened());
    assert!(opener.opened() >= 1);
}

#[tokio::test]
async fn test_acquire_times_out_at_capacity() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new()
        .max_size(2)
        .acquire_timeout(Duration::from_millis(100));

    let held_a = factory.acquire(&key(), &config, None).await.unwrap();
    let held_b = factory.acquire(&key(), &config, None).await.unwrap();

    let start = tokio::time::Instant::now();
    let err = factory.acquire(&key(), &config, None).await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(2));

    drop(held_a);
    drop(held_b);
}

#[tokio::test]
async fn test_waiter_wakes_on_release() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new()
        .max_size(1)
        .acquire_timeout(Duration::from_secs(5));

    let held = factory.acquire(&key(), &config, None).await.unwrap();
    let waiter = {
        let factory = Arc::clone(&factory);
        let config = config.clone();
        tokio::spawn(async move { factory.acquire(&key(), &config, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(held);
    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(opener.opened(), 1);
    drop(conn);
}

#[tokio::test]
async fn test_broken_connection_destroyed_on_release() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(2);

    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    let broken_id = conn.id();
    conn.mark_broken();
    drop(conn);

    let replacement = factory.acquire(&key(), &config, None).await.unwrap();
    assert_ne!(replacement.id(), broken_id);
    assert_eq!(opener.opened(), 2);
}

#[tokio::test]
async fn test_open_failure_propagates_and_frees_slot() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(1);

    opener.fail.store(true, Ordering::SeqCst);
    let err = factory.acquire(&key(), &config, None).await.unwrap_err();
    assert!(matches!(err, PoolError::Creation(_)));

    // The reserved slot must be freed, or this second attempt would hang.
    opener.fail.store(false, Ordering::SeqCst);
    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    drop(conn);
}

#[tokio::test]
async fn test_clear_pool_replaces_group() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(2);

    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    drop(conn);
    assert_eq!(factory.group_count(), 1);

    factory.clear_pool(&key());

    // The old idle connection was destroyed with its pool.
    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    drop(conn);
    assert_eq!(opener.opened(), 2);
    assert_eq!(factory.group_count(), 1);
}

#[tokio::test]
async fn test_clear_pool_destroys_checked_out_on_return() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(2);

    let held = factory.acquire(&key(), &config, None).await.unwrap();
    factory.clear_pool(&key());
    drop(held);

    // Sweeping now finds the released pool fully drained.
    factory.prune_now();

    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    drop(conn);
    assert_eq!(opener.opened(), 2);
}

#[tokio::test]
async fn test_waiter_lands_on_fresh_pool_after_clear() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new()
        .max_size(1)
        .acquire_timeout(Duration::from_secs(5));

    let held = factory.acquire(&key(), &config, None).await.unwrap();
    let waiter = {
        let factory = Arc::clone(&factory);
        let config = config.clone();
        tokio::spawn(async move { factory.acquire(&key(), &config, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    // Shutting the pool down mid-wait wakes the waiter with nothing to
    // check out; it must re-resolve and land on the replacement pool.
    factory.clear_pool(&key());

    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(opener.opened(), 2);
    assert_eq!(factory.group_count(), 1);

    // The old connection belongs to the cleared pool and is destroyed.
    drop(held);
    drop(conn);
}

#[tokio::test]
async fn test_pruning_walks_group_to_release() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(2);

    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    drop(conn);
    assert_eq!(factory.group_count(), 1);

    // First sweep empties the pool (min_size 0) and marks the group idle;
    // the second retires the group entirely.
    factory.prune_now();
    assert_eq!(factory.group_count(), 1);
    factory.prune_now();
    assert_eq!(factory.group_count(), 0);

    // A later acquisition builds everything anew.
    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    drop(conn);
    assert_eq!(factory.group_count(), 1);
    assert_eq!(opener.opened(), 2);
}

#[tokio::test]
async fn test_min_size_survives_pruning() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().min_size(1).max_size(4);

    let a = factory.acquire(&key(), &config, None).await.unwrap();
    let b = factory.acquire(&key(), &config, None).await.unwrap();
    drop(a);
    drop(b);

    factory.prune_now();

    // One idle connection remains, so the next acquisition reuses it.
    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    drop(conn);
    assert_eq!(opener.opened(), 2);
}

#[tokio::test]
async fn test_distinct_keys_use_distinct_pools() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(2);

    let a = factory
        .acquire(&PoolKey::new("server=db1"), &config, None)
        .await
        .unwrap();
    let b = factory
        .acquire(&PoolKey::new("server=db2"), &config, None)
        .await
        .unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(factory.group_count(), 2);
    assert_eq!(opener.opened(), 2);
}

#[tokio::test]
async fn test_detach_removes_from_accounting() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(1);

    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    let detached = conn.detach();

    // The slot is free again even though the connection is still alive.
    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    drop(conn);
    drop(detached);
    assert_eq!(opener.opened(), 2);
}

#[tokio::test]
async fn test_non_pooled_sync_acquisition() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().pooling_enabled(false);

    let a = factory.acquire(&key(), &config, Some(9)).await.unwrap();
    let b = factory.acquire(&key(), &config, Some(9)).await.unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.owner(), Some(9));

    let stats = factory.stats();
    assert_eq!(stats.hard_connects, 2);
    assert_eq!(stats.non_pooled_connections, 2);
}

#[tokio::test]
async fn test_non_pooled_completion_is_throttled() {
    let opener = MockOpener::with_delay(Duration::from_millis(50));
    let factory = ConnectionFactory::new(
        Arc::clone(&opener) as Arc<dyn ConnectionOpener>,
        FactoryOptions::new()
            .pruning_due_time(Duration::from_secs(3600))
            .throttle_slots(2),
    );
    let config = PoolConfig::new().pooling_enabled(false);

    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (tx, rx) = oneshot::channel();
        factory.acquire_non_pooled(&key(), &config, None, tx).unwrap();
        receivers.push(rx);
    }
    for rx in receivers {
        let conn = rx.await.unwrap().unwrap();
        drop(conn);
    }

    assert_eq!(opener.opened(), 3);
    assert!(opener.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(factory.stats().non_pooled_connections, 3);
}

#[tokio::test]
async fn test_abandoned_non_pooled_request_destroys_connection() {
    let opener = MockOpener::with_delay(Duration::from_millis(50));
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().pooling_enabled(false);

    let (tx, rx) = oneshot::channel();
    factory.acquire_non_pooled(&key(), &config, None, tx).unwrap();
    drop(rx);

    tokio::time::sleep(Duration::from_millis(150)).await;

    // The connection was opened but never delivered.
    assert_eq!(opener.opened(), 1);
    assert_eq!(factory.stats().non_pooled_connections, 0);

    // The slot stayed usable for the next requester.
    let (tx, rx) = oneshot::channel();
    factory.acquire_non_pooled(&key(), &config, None, tx).unwrap();
    let conn = rx.await.unwrap().unwrap();
    drop(conn);
    assert_eq!(factory.stats().non_pooled_connections, 1);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(0);

    let err = factory.acquire(&key(), &config, None).await.unwrap_err();
    assert!(matches!(err, PoolError::Configuration(_)));
    assert_eq!(opener.opened(), 0);
}

#[tokio::test]
async fn test_multiplexed_pool_opens_sessions() {
    let opener = MockOpener::new();
    let factory = quiet_factory(Arc::clone(&opener));
    let config = PoolConfig::new().max_size(1).multiplexing_enabled(true);

    let conn = factory.acquire(&key(), &config, None).await.unwrap();
    assert!(conn.is_multiplexed());
    let session = conn.open_session().await.unwrap();
    assert_eq!(session.id(), 0);
}
